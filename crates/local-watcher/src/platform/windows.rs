//! ReadDirectoryChangesW reports a rename inside a directory as two consecutive notifications,
//! the old name then the new one. A move to another directory is only seen as a deletion
//! followed by a creation, so the pipeline has to match them by file id itself.

use crate::event::Kind;

use std::{path::PathBuf, time::Duration};

use notify::{
	event::{ModifyKind, RenameMode},
	Event, EventKind,
};
use tokio::time::Instant;
use tracing::trace;

use super::{create_kind, remove_kind, PlatformWatchBackend, RawChange};

const HUNDRED_MILLIS: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct ReadDirectoryChangesBackend {
	rename_from: Option<(Instant, PathBuf)>,
}

impl ReadDirectoryChangesBackend {
	fn flush_rename_from(&mut self, changes: &mut Vec<RawChange>) {
		if let Some((_, path)) = self.rename_from.take() {
			trace!(path = %path.display(), "Rename without new name, handling as removal");
			changes.push(RawChange::Removed {
				path,
				kind: Kind::Unknown,
			});
		}
	}
}

impl PlatformWatchBackend for ReadDirectoryChangesBackend {
	fn name(&self) -> &'static str {
		"read-directory-changes"
	}

	fn reports_moves(&self) -> bool {
		false
	}

	fn handle_event(&mut self, event: Event) -> Vec<RawChange> {
		let mut changes = Vec::new();

		if event.need_rescan() {
			self.flush_rename_from(&mut changes);
			changes.push(RawChange::Rescan);
			return changes;
		}

		let Event {
			kind, mut paths, ..
		} = event;

		if paths.is_empty() {
			trace!(?kind, "Ignoring event without path");
			return changes;
		}

		if let EventKind::Modify(ModifyKind::Name(RenameMode::To)) = kind {
			let to = paths.remove(0);
			if let Some((_, from)) = self.rename_from.take() {
				changes.push(RawChange::Renamed {
					from,
					to,
					kind: Kind::Unknown,
				});
			} else {
				changes.push(RawChange::Created {
					path: to,
					kind: Kind::Unknown,
				});
			}
			return changes;
		}

		// Both halves of a rename are always consecutive
		self.flush_rename_from(&mut changes);

		match kind {
			EventKind::Create(created) => changes.push(RawChange::Created {
				path: paths.remove(0),
				kind: create_kind(created),
			}),

			EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
				self.rename_from = Some((Instant::now(), paths.remove(0)));
			}

			EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
				let to = paths.remove(1);
				changes.push(RawChange::Renamed {
					from: paths.remove(0),
					to,
					kind: Kind::Unknown,
				});
			}

			EventKind::Modify(ModifyKind::Any | ModifyKind::Data(_)) => {
				changes.push(RawChange::Modified {
					path: paths.remove(0),
					kind: Kind::Unknown,
				});
			}

			EventKind::Remove(removed) => changes.push(RawChange::Removed {
				path: paths.remove(0),
				kind: remove_kind(removed),
			}),

			other_event_kind => {
				trace!(?other_event_kind, "Other event that we don't handle;");
			}
		}

		changes
	}

	fn tick(&mut self) -> Vec<RawChange> {
		let mut changes = Vec::new();

		if self
			.rename_from
			.as_ref()
			.is_some_and(|(instant, _)| instant.elapsed() > HUNDRED_MILLIS)
		{
			self.flush_rename_from(&mut changes);
		}

		changes
	}
}
