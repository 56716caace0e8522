//! Adaptation of the notifications of each OS level watch backend.
//!
//! The producer never looks at platform specific notifications: a [`PlatformWatchBackend`]
//! turns them into [`RawChange`]s, holding them back when it needs to pair them.

use crate::event::Kind;

use std::path::PathBuf;

use notify::{
	event::{CreateKind, RemoveKind},
	Event,
};

mod linux;
mod windows;

pub use linux::InotifyBackend;
pub use windows::ReadDirectoryChangesBackend;

/// A change on an absolute path, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
	Created { path: PathBuf, kind: Kind },
	Modified { path: PathBuf, kind: Kind },
	Removed { path: PathBuf, kind: Kind },
	Renamed { from: PathBuf, to: PathBuf, kind: Kind },
	/// The kernel dropped notifications, the whole directory must be scanned again
	Rescan,
}

impl RawChange {
	#[must_use]
	pub fn paths(&self) -> Vec<&PathBuf> {
		match self {
			Self::Created { path, .. } | Self::Modified { path, .. } | Self::Removed { path, .. } => {
				vec![path]
			}
			Self::Renamed { from, to, .. } => vec![from, to],
			Self::Rescan => vec![],
		}
	}
}

pub trait PlatformWatchBackend: Send + 'static {
	fn name(&self) -> &'static str;

	/// Whether moves across directories are reported as renames. When they are not, the
	/// pipeline has to rebuild them from deletion and creation pairs.
	fn reports_moves(&self) -> bool;

	/// Handle a notification, returning the changes it completed.
	fn handle_event(&mut self, event: Event) -> Vec<RawChange>;

	/// Called periodically, so notifications waiting for a counterpart can be flushed.
	fn tick(&mut self) -> Vec<RawChange>;
}

/// The backend of the platform we are running on.
#[must_use]
pub fn current() -> Box<dyn PlatformWatchBackend> {
	if cfg!(windows) {
		Box::new(ReadDirectoryChangesBackend::default())
	} else {
		Box::new(InotifyBackend::default())
	}
}

fn create_kind(kind: CreateKind) -> Kind {
	match kind {
		CreateKind::File => Kind::File,
		CreateKind::Folder => Kind::Directory,
		CreateKind::Any | CreateKind::Other => Kind::Unknown,
	}
}

fn remove_kind(kind: RemoveKind) -> Kind {
	match kind {
		RemoveKind::File => Kind::File,
		RemoveKind::Folder => Kind::Directory,
		RemoveKind::Any | RemoveKind::Other => Kind::Unknown,
	}
}
