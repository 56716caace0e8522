//! Enrich events with the stats of their entry, and the kind and identity their document
//! had when the entry is gone.

use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	event::{Action, Event, Kind},
	stats::stat,
	store::DocumentStore,
};

use std::sync::Arc;

use tracing::{debug, warn};

pub const STEP_NAME: &str = "add_infos";

pub struct AddInfos {
	config: Arc<WatcherConfig>,
	store: Arc<dyn DocumentStore>,
}

impl AddInfos {
	#[must_use]
	pub fn new(config: Arc<WatcherConfig>, store: Arc<dyn DocumentStore>) -> Self {
		Self { config, store }
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
			if event.kind == Kind::Symlink {
				warn!(path = %event.path.display(), "Symlinks are not supported;");
				continue;
			}

			if event.action == Action::InitialScanDone {
				batch.push(event);
				continue;
			}

			let event = self.add_infos(event).await;

			if event.kind == Kind::Symlink {
				warn!(path = %event.path.display(), "Symlinks are not supported;");
				continue;
			}

			batch.push(event);
		}

		batch
	}

	async fn add_infos(&self, mut event: Event) -> Event {
		if event.action.has_content() && event.stats.is_none() {
			debug!(path = %event.path.display(), action = ?event.action, "stat");
			match stat(self.config.absolute(&event.path)).await {
				Ok(stats) => event = event.with_stats(stats),
				Err(e) => {
					debug!(?e, path = %event.path.display(), "Cannot get infos;");
					return event.mark_incomplete(STEP_NAME, e);
				}
			}
		}

		if event.stats.is_some() {
			return event;
		}

		if event.action == Action::Deleted || !matches!(event.kind, Kind::File | Kind::Directory) {
			// Even for a deletion, the document probably knows the kind better than we do
			match self.store.by_local_path(&event.path).await {
				Ok(doc) => {
					if !matches!(event.kind, Kind::File | Kind::Directory) {
						event.kind = doc.as_ref().map_or(Kind::File, |doc| doc.event_kind());
					}
					if event.action == Action::Deleted {
						if let Some(identity) = doc.and_then(|doc| doc.identity()) {
							event.deleted_ino = Some(identity);
						}
					}
				}
				Err(e) => {
					debug!(?e, path = %event.path.display(), "Cannot get infos;");
					return event.mark_incomplete(STEP_NAME, e);
				}
			}
		}

		event
	}
}

#[cfg(test)]
mod tests {
	use crate::{
		event::Identity,
		store::DocKind,
		test_utils::{doc, MemoryStore},
	};

	use std::path::Path;

	use tokio::fs;

	use super::*;

	fn step(root: &Path, store: Arc<MemoryStore>) -> AddInfos {
		AddInfos::new(Arc::new(WatcherConfig::new(root)), store)
	}

	#[tokio::test]
	async fn existing_entries_get_stats_and_kind() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir(dir.path().join("dir")).await.unwrap();
		fs::write(dir.path().join("file"), b"x").await.unwrap();

		let batch = step(dir.path(), MemoryStore::with_docs([]))
			.process(vec![
				Event::new(Action::Created, Kind::Unknown, "dir"),
				Event::new(Action::Modified, Kind::Unknown, "file"),
			])
			.await;

		assert_eq!(batch[0].kind, Kind::Directory);
		assert_eq!(batch[1].kind, Kind::File);
		assert!(batch.iter().all(|event| event.stats.is_some() && event.ino.is_some()));
	}

	#[tokio::test]
	async fn vanished_entries_are_kept_incomplete() {
		let dir = tempfile::tempdir().unwrap();

		let batch = step(dir.path(), MemoryStore::with_docs([]))
			.process(vec![Event::new(Action::Created, Kind::Unknown, "gone")])
			.await;

		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].incomplete.as_ref().unwrap().step, STEP_NAME);
	}

	#[tokio::test]
	async fn deletions_get_kind_and_identity_from_their_document() {
		let dir = tempfile::tempdir().unwrap();
		let store = MemoryStore::with_docs([doc("dir", DocKind::Folder, 7)]);

		let batch = step(dir.path(), store)
			.process(vec![
				Event::new(Action::Deleted, Kind::Unknown, "dir"),
				Event::new(Action::Deleted, Kind::Unknown, "unknown"),
			])
			.await;

		assert_eq!(batch[0].kind, Kind::Directory);
		assert_eq!(batch[0].deleted_ino, Some(Identity::Inode(7)));
		assert_eq!(batch[1].kind, Kind::File);
		assert_eq!(batch[1].deleted_ino, None);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn symlinks_are_dropped() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("target"), b"x").await.unwrap();
		fs::symlink(dir.path().join("target"), dir.path().join("link"))
			.await
			.unwrap();

		let batch = step(dir.path(), MemoryStore::with_docs([]))
			.process(vec![
				Event::new(Action::Created, Kind::Unknown, "link"),
				Event::new(Action::Created, Kind::Symlink, "other"),
				Event::initial_scan_done(),
			])
			.await;

		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].action, Action::InitialScanDone);
	}
}
