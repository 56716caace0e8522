//! inotify reports each side of a rename separately, paired by a cookie that notify exposes
//! as the event tracker: `Name(From)` then `Name(To)`, followed by a `Name(Both)` holding the
//! two paths. A `From` without counterpart means the entry was moved out of the watched
//! directory, a `To` without counterpart that it was moved in.

use crate::event::Kind;

use std::{collections::HashMap, path::PathBuf, time::Duration};

use notify::{
	event::{AccessKind, AccessMode, ModifyKind, RenameMode},
	Event, EventKind,
};
use tokio::time::Instant;
use tracing::trace;

use super::{create_kind, remove_kind, PlatformWatchBackend, RawChange};

const HUNDRED_MILLIS: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct InotifyBackend {
	rename_from: HashMap<usize, (Instant, PathBuf)>,
	untracked_from: Vec<(Instant, PathBuf)>,
}

impl PlatformWatchBackend for InotifyBackend {
	fn name(&self) -> &'static str {
		"inotify"
	}

	fn reports_moves(&self) -> bool {
		true
	}

	fn handle_event(&mut self, event: Event) -> Vec<RawChange> {
		if event.need_rescan() {
			return vec![RawChange::Rescan];
		}

		let tracker = event.tracker();
		let Event {
			kind, mut paths, ..
		} = event;

		if paths.is_empty() {
			trace!(?kind, "Ignoring event without path");
			return vec![];
		}

		match kind {
			EventKind::Create(created) => vec![RawChange::Created {
				path: paths.remove(0),
				kind: create_kind(created),
			}],

			EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
			| EventKind::Access(AccessKind::Close(AccessMode::Write)) => vec![RawChange::Modified {
				path: paths.remove(0),
				kind: Kind::Unknown,
			}],

			EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
				let path = paths.remove(0);
				if let Some(tracker) = tracker {
					self.rename_from.insert(tracker, (Instant::now(), path));
				} else {
					self.untracked_from.push((Instant::now(), path));
				}
				vec![]
			}

			EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
				let paired = tracker.is_some_and(|tracker| self.rename_from.contains_key(&tracker));
				if paired {
					// The `Both` event that follows carries the two paths
					vec![]
				} else {
					vec![RawChange::Created {
						path: paths.remove(0),
						kind: Kind::Unknown,
					}]
				}
			}

			EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
				if let Some(tracker) = tracker {
					self.rename_from.remove(&tracker);
				}
				let to = paths.remove(1);
				let from = paths.remove(0);
				self.untracked_from.retain(|(_, path)| path != &from);

				vec![RawChange::Renamed {
					from,
					to,
					kind: Kind::Unknown,
				}]
			}

			EventKind::Remove(removed) => vec![RawChange::Removed {
				path: paths.remove(0),
				kind: remove_kind(removed),
			}],

			other_event_kind => {
				trace!(?other_event_kind, "Other event that we don't handle;");
				vec![]
			}
		}
	}

	fn tick(&mut self) -> Vec<RawChange> {
		let mut changes = Vec::new();

		self.rename_from.retain(|_, (instant, path)| {
			if instant.elapsed() > HUNDRED_MILLIS {
				trace!(path = %path.display(), "Moved out of the watched directory");
				changes.push(RawChange::Removed {
					path: path.clone(),
					kind: Kind::Unknown,
				});
				false
			} else {
				true
			}
		});

		self.untracked_from.retain(|(instant, path)| {
			if instant.elapsed() > HUNDRED_MILLIS {
				changes.push(RawChange::Removed {
					path: path.clone(),
					kind: Kind::Unknown,
				});
				false
			} else {
				true
			}
		});

		changes
	}
}
