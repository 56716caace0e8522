use crate::{
	channel::{Batch, Channel},
	checksum::ContentHasher,
	config::WatcherConfig,
	event::{Action, Event},
};

use std::sync::Arc;

use tracing::{debug, error};

pub const STEP_NAME: &str = "add_checksum";

/// Computes the checksum of files whose content is supposed to exist at the event path.
///
/// Events already carrying a checksum, because their file is known not to have changed, are
/// left alone. A file gone or busy makes the event incomplete: one of its ancestors may have
/// been moved, which a later event will tell.
pub struct AddChecksum {
	config: Arc<WatcherConfig>,
	hasher: Arc<dyn ContentHasher>,
}

impl AddChecksum {
	#[must_use]
	pub fn new(config: Arc<WatcherConfig>, hasher: Arc<dyn ContentHasher>) -> Self {
		Self { config, hasher }
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		let this = Arc::new(self);
		input.async_map(move |batch| {
			let this = Arc::clone(&this);
			async move { this.process(batch).await }
		})
	}

	pub async fn process(&self, events: Batch) -> Batch {
		let mut batch = Batch::with_capacity(events.len());

		for event in events {
			if event.is_incomplete() || !is_file_with_content(&event) || event.md5sum.is_some() {
				batch.push(event);
				continue;
			}

			match self.hasher.hash(&self.config.absolute(&event.path)).await {
				Ok(md5sum) => {
					debug!(path = %event.path.display(), %md5sum, "Computed checksum");
					batch.push(event.with_md5sum(Some(md5sum)));
				}
				Err(e) if e.is_not_found() || e.is_busy() => {
					debug!(?e, path = %event.path.display(), "Cannot compute checksum;");
					batch.push(event.mark_incomplete(STEP_NAME, e));
				}
				Err(e) => {
					error!(?e, path = %event.path.display(), "Failed to compute checksum, dropping event;");
				}
			}
		}

		batch
	}
}

fn is_file_with_content(event: &Event) -> bool {
	event.is_file()
		&& matches!(
			event.action,
			Action::Created | Action::Modified | Action::Renamed | Action::Scan
		)
}
