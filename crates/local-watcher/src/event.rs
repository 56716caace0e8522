use std::{
	fmt,
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use super::stats::Stats;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process wide unique identifier of an [`Event`], used to key the provenance log.
///
/// Every event built by a step gets a fresh id, even when derived from a previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(u64);

impl EventId {
	fn next() -> Self {
		Self(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
	Created,
	Modified,
	Deleted,
	Renamed,
	Scan,
	InitialScanDone,
	Ignored,
}

impl Action {
	/// Actions implying that some content exists at the event path.
	#[must_use]
	pub const fn has_content(self) -> bool {
		matches!(
			self,
			Self::Created | Self::Modified | Self::Renamed | Self::Scan
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
	File,
	Directory,
	Symlink,
	Unknown,
}

/// Platform file identity: inode number on Unix, NTFS file id on Windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
	Inode(u64),
	FileId(String),
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Inode(ino) => write!(f, "ino:{ino}"),
			Self::FileId(id) => write!(f, "fileid:{id}"),
		}
	}
}

/// Why a step couldn't fully resolve an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incomplete {
	pub step: &'static str,
	pub reason: String,
}

/// The unit flowing through the pipeline.
///
/// Paths are relative to the synchronized directory. Once pushed into a [`Channel`], an event
/// is never modified again: steps changing it build a new one with [`Event::derive`].
///
/// [`Channel`]: crate::Channel
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
	pub id: EventId,
	pub action: Action,
	pub kind: Kind,
	pub path: PathBuf,
	pub old_path: Option<PathBuf>,
	pub ino: Option<Identity>,
	pub deleted_ino: Option<Identity>,
	pub stats: Option<Stats>,
	pub md5sum: Option<String>,
	pub incomplete: Option<Incomplete>,
	pub no_ignore: bool,
	pub overwrite: bool,
}

impl Event {
	#[must_use]
	pub fn new(action: Action, kind: Kind, path: impl Into<PathBuf>) -> Self {
		Self {
			id: EventId::next(),
			action,
			kind,
			path: path.into(),
			old_path: None,
			ino: None,
			deleted_ino: None,
			stats: None,
			md5sum: None,
			incomplete: None,
			no_ignore: false,
			overwrite: false,
		}
	}

	#[must_use]
	pub fn renamed(kind: Kind, old_path: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
		Self::new(Action::Renamed, kind, path).with_old_path(old_path)
	}

	/// Marker pushed by the producer once the initial scan is over.
	#[must_use]
	pub fn initial_scan_done() -> Self {
		Self {
			no_ignore: true,
			..Self::new(Action::InitialScanDone, Kind::Unknown, PathBuf::new())
		}
	}

	/// A copy of this event with a fresh id, to be changed by the caller before pushing it.
	#[must_use]
	pub fn derive(&self) -> Self {
		Self {
			id: EventId::next(),
			..self.clone()
		}
	}

	#[must_use]
	pub fn with_action(mut self, action: Action) -> Self {
		self.action = action;
		self
	}

	#[must_use]
	pub fn with_kind(mut self, kind: Kind) -> Self {
		self.kind = kind;
		self
	}

	#[must_use]
	pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.path = path.into();
		self
	}

	#[must_use]
	pub fn with_old_path(mut self, old_path: impl Into<PathBuf>) -> Self {
		self.old_path = Some(old_path.into());
		self
	}

	#[must_use]
	pub fn without_old_path(mut self) -> Self {
		self.old_path = None;
		self
	}

	#[must_use]
	pub fn with_ino(mut self, ino: Identity) -> Self {
		self.ino = Some(ino);
		self
	}

	#[must_use]
	pub fn with_deleted_ino(mut self, deleted_ino: Option<Identity>) -> Self {
		self.deleted_ino = deleted_ino;
		self
	}

	/// Attach stats, which also fix the event kind and identity.
	#[must_use]
	pub fn with_stats(mut self, stats: Stats) -> Self {
		self.kind = stats.kind;
		if let Some(identity) = &stats.identity {
			self.ino = Some(identity.clone());
		}
		self.stats = Some(stats);
		self
	}

	#[must_use]
	pub fn without_stats(mut self) -> Self {
		self.stats = None;
		self
	}

	#[must_use]
	pub fn with_md5sum(mut self, md5sum: Option<String>) -> Self {
		self.md5sum = md5sum;
		self
	}

	#[must_use]
	pub fn with_overwrite(mut self) -> Self {
		self.overwrite = true;
		self
	}

	#[must_use]
	pub fn mark_incomplete(mut self, step: &'static str, reason: impl fmt::Display) -> Self {
		self.incomplete = Some(Incomplete {
			step,
			reason: reason.to_string(),
		});
		self
	}

	#[must_use]
	pub fn completed(mut self) -> Self {
		self.incomplete = None;
		self
	}

	#[must_use]
	pub const fn is_incomplete(&self) -> bool {
		self.incomplete.is_some()
	}

	#[must_use]
	pub fn is_file(&self) -> bool {
		self.kind == Kind::File
	}

	/// Identity of the entry this event is about: the stat one when available, else the one
	/// the entry had before being deleted.
	#[must_use]
	pub fn identity(&self) -> Option<&Identity> {
		self.stats
			.as_ref()
			.and_then(|stats| stats.identity.as_ref())
			.or(self.ino.as_ref())
			.or(self.deleted_ino.as_ref())
	}

	/// Identity reported by a stat call, the only one proving an entry exists right now.
	#[must_use]
	pub fn stats_identity(&self) -> Option<&Identity> {
		self.stats.as_ref().and_then(|stats| stats.identity.as_ref())
	}
}

/// `path` is `ancestor` itself or one of its descendants, compared component-wise.
#[must_use]
pub fn is_same_or_descendant(path: &Path, ancestor: &Path) -> bool {
	path.starts_with(ancestor)
}

/// `path` is a strict descendant of `ancestor`.
#[must_use]
pub fn is_strict_descendant(path: &Path, ancestor: &Path) -> bool {
	path != ancestor && path.starts_with(ancestor)
}

/// Replace the `from` prefix of `path` by `to`, when `path` is `from` or under it.
#[must_use]
pub fn replace_prefix(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
	path.strip_prefix(from).ok().map(|rest| {
		if rest.as_os_str().is_empty() {
			to.to_path_buf()
		} else {
			to.join(rest)
		}
	})
}
