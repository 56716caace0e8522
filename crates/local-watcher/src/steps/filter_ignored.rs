use crate::{
	channel::{Batch, Channel},
	event::{Action, Event, Kind},
	ignore::IgnoreRules,
	provenance::AuditLog,
};

use std::sync::Arc;

use tracing::debug;

pub const STEP_NAME: &str = "filter_ignored";

/// Drops events about ignored paths.
///
/// A rename crossing the boundary of the ignored set is turned into a deletion of the old path
/// or a creation at the new one, so the synchronized tree stays consistent.
pub struct FilterIgnored {
	ignore: Arc<dyn IgnoreRules>,
	audit: Arc<AuditLog>,
}

impl FilterIgnored {
	#[must_use]
	pub fn new(ignore: Arc<dyn IgnoreRules>, audit: Arc<AuditLog>) -> Self {
		Self { ignore, audit }
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		input.map(move |batch| self.process(batch))
	}

	pub fn process(&self, events: Batch) -> Batch {
		events
			.into_iter()
			.filter_map(|event| self.filter(event))
			.collect()
	}

	fn filter(&self, event: Event) -> Option<Event> {
		if event.no_ignore {
			return Some(event);
		}

		let is_folder = event.kind == Kind::Directory;
		let ignored = self.ignore.is_ignored(&event.path, is_folder);

		let Some(old_path) = event
			.old_path
			.as_ref()
			.filter(|_| event.action == Action::Renamed)
		else {
			if ignored {
				debug!(path = %event.path.display(), action = ?event.action, "Ignored");
				return None;
			}
			return Some(event);
		};

		match (self.ignore.is_ignored(old_path, is_folder), ignored) {
			(false, false) => Some(event),
			(true, true) => {
				debug!(path = %event.path.display(), "Ignored rename");
				None
			}
			(false, true) => {
				let deleted = Event::new(Action::Deleted, event.kind, old_path.clone())
					.with_deleted_ino(event.identity().cloned());
				debug!(path = %deleted.path.display(), "Renamed into an ignored path, deleted");
				self.audit
					.record(deleted.id, STEP_NAME, [event.id], "renamed to ignored path");
				Some(deleted)
			}
			(true, false) => {
				let created = event
					.derive()
					.with_action(Action::Created)
					.without_old_path();
				debug!(path = %created.path.display(), "Renamed from an ignored path, created");
				self.audit
					.record(created.id, STEP_NAME, [event.id], "renamed from ignored path");
				Some(created)
			}
		}
	}
}
