use crate::{
	channel::{Batch, Channel},
	event::{Action, Kind},
	producer::Scanner,
};

use std::sync::Arc;

use tracing::{debug, warn};

pub const STEP_NAME: &str = "scan_folder";

/// A folder moved in from outside the synchronized directory comes with its whole content,
/// which is never notified. Every created folder is scanned, the scan events going back
/// through the head of the pipeline.
pub struct ScanFolder {
	scanner: Scanner,
}

impl ScanFolder {
	#[must_use]
	pub fn new(scanner: Scanner) -> Self {
		Self { scanner }
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		let this = Arc::new(self);
		input.async_map(move |batch| {
			let this = Arc::clone(&this);
			async move {
				this.process(&batch).await;
				batch
			}
		})
	}

	pub async fn process(&self, batch: &Batch) {
		for event in batch
			.iter()
			.filter(|event| event.action == Action::Created && event.kind == Kind::Directory)
		{
			debug!(path = %event.path.display(), "Scanning created folder");
			if let Err(e) = self.scanner.scan(&event.path).await {
				warn!(?e, path = %event.path.display(), "Failed to scan created folder;");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::{
		config::WatcherConfig,
		event::Event,
		ignore::IgnoreList,
		test_utils::{expected, next_batch, summaries},
	};

	use tokio::fs;

	use super::*;

	#[tokio::test]
	async fn created_folders_are_scanned_and_batches_forwarded() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("moved-in/sub")).await.unwrap();
		fs::write(dir.path().join("moved-in/file"), b"x").await.unwrap();

		let head = Channel::new();
		let scanner = Scanner::new(
			Arc::new(WatcherConfig::new(dir.path())),
			Arc::new(IgnoreList::default()),
			head.clone(),
		);

		let input = Channel::new();
		let out = ScanFolder::new(scanner).spawn(input.clone());

		input.push(vec![
			Event::new(Action::Created, Kind::Directory, "moved-in"),
			Event::new(Action::Created, Kind::File, "other"),
		]);

		assert_eq!(next_batch(&out).await.len(), 2);
		assert_eq!(
			summaries(&next_batch(&head).await),
			[
				expected(Action::Scan, "moved-in/file", None),
				expected(Action::Scan, "moved-in/sub", None),
			]
		);
	}
}
