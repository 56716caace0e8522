//! Incomplete events are about entries that were gone by the time a step looked at them.
//!
//! A file written then moved along with one of its ancestors can't be checksummed at the
//! written path, but the event moving the ancestor tells where it went. Incomplete events are
//! kept a few seconds, waiting for such a completing event, then silently dropped.

use crate::{
	channel::{Batch, Channel},
	checksum::ContentHasher,
	config::WatcherConfig,
	event::{is_same_or_descendant, is_strict_descendant, replace_prefix, Action, Event, Kind},
	provenance::AuditLog,
	stats::stat_maybe,
	store::DocumentStore,
};

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::TimedStep;

pub const STEP_NAME: &str = "incomplete_fixer";

#[derive(Debug)]
struct Incomplete {
	event: Event,
	since: Instant,
}

#[derive(Debug)]
enum Completion {
	/// The completing event cancels the incomplete one.
	Ignored,
	Rebuilt(Event),
}

pub struct IncompleteFixer {
	config: Arc<WatcherConfig>,
	store: Arc<dyn DocumentStore>,
	hasher: Arc<dyn ContentHasher>,
	audit: Arc<AuditLog>,
	incompletes: Vec<Incomplete>,
}

impl IncompleteFixer {
	#[must_use]
	pub fn new(
		config: Arc<WatcherConfig>,
		store: Arc<dyn DocumentStore>,
		hasher: Arc<dyn ContentHasher>,
		audit: Arc<AuditLog>,
	) -> Self {
		Self {
			config,
			store,
			hasher,
			audit,
			incompletes: Vec::new(),
		}
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		super::spawn_timed(self, input)
	}

	pub async fn process(&mut self, events: Batch) -> Batch {
		let now = Instant::now();
		self.incompletes.extend(
			events
				.iter()
				.filter(|event| event.is_incomplete() && event.action != Action::Ignored)
				.map(|event| {
					debug!(path = %event.path.display(), action = ?event.action, "Incomplete");
					Incomplete {
						event: event.clone(),
						since: now,
					}
				}),
		);

		let mut batch = Batch::with_capacity(events.len());

		for event in events {
			self.expire(Instant::now());

			if self.incompletes.is_empty()
				|| !matches!(
					event.action,
					Action::Renamed | Action::Deleted | Action::Created
				) {
				if !event.is_incomplete() {
					batch.push(event);
				}
				continue;
			}

			self.complete_with(event, &mut batch).await;
		}

		batch
	}

	fn expire(&mut self, now: Instant) {
		let expiry = self.config.incomplete_expiry();
		self.incompletes.retain(|item| {
			let expired = now.duration_since(item.since) > expiry;
			if expired {
				debug!(path = %item.event.path.display(), "Dropping expired incomplete event");
			}
			!expired
		});
	}

	/// Try to complete every held incomplete event with this one, pushing the completing event
	/// first, then the rebuilt ones.
	async fn complete_with(&mut self, event: Event, batch: &mut Batch) {
		let mut keep_event = !event.is_incomplete();
		let mut rebuilt_events = Vec::new();
		let mut still_incomplete = Vec::with_capacity(self.incompletes.len());

		for item in std::mem::take(&mut self.incompletes) {
			if item.event.id == event.id {
				still_incomplete.push(item);
				continue;
			}

			let rebuilt = match self.detect_completion(&item.event, &event).await {
				None => {
					still_incomplete.push(item);
					continue;
				}
				Some(Completion::Ignored) => {
					debug!(
						path = %item.event.path.display(),
						completing = %event.path.display(),
						"Incomplete event cancelled",
					);
					keep_event = false;
					continue;
				}
				Some(Completion::Rebuilt(rebuilt)) => rebuilt,
			};

			debug!(path = %rebuilt.path.display(), action = ?rebuilt.action, "Rebuilt incomplete event");

			let existing = match self.store.by_local_path(&item.event.path).await {
				Ok(doc) => doc.filter(|doc| !doc.trashed),
				Err(e) => {
					warn!(?e, path = %item.event.path.display(), "Failed to look up incomplete document;");
					None
				}
			};

			match (existing.is_some(), item.event.action) {
				// A document already exists at this path, the completing event is enough
				(true, Action::Created | Action::Scan) => continue,
				// Don't miss content changes, and apply the completing event to the document
				(true, Action::Modified) => rebuilt_events.push(rebuilt),
				// The completing event is about a parent of the rebuilt one
				_ if is_strict_descendant(&rebuilt.path, &event.path) => {
					rebuilt_events.push(rebuilt);
				}
				_ => {
					keep_event = false;
					rebuilt_events.push(rebuilt);
				}
			}
		}

		let now = Instant::now();
		if keep_event {
			batch.push(event);
		}
		for rebuilt in rebuilt_events {
			if rebuilt.is_incomplete() {
				still_incomplete.push(Incomplete {
					event: rebuilt,
					since: now,
				});
			} else {
				batch.push(rebuilt);
			}
		}

		self.incompletes = still_incomplete;
	}

	async fn detect_completion(&self, item: &Event, next: &Event) -> Option<Completion> {
		let completion = if was_renamed_successively(item, next) {
			self.rebuild(item, next).await?
		} else if item_destination_was_deleted(item, next) {
			let old_path = item.old_path.clone()?;
			Completion::Rebuilt(Event::new(Action::Deleted, item.kind, old_path))
		} else if renamed_item_was_replaced(item, next) {
			Completion::Rebuilt(next.derive().with_action(Action::Modified))
		} else {
			return None;
		};

		if let Completion::Rebuilt(rebuilt) = &completion {
			self.audit
				.record(rebuilt.id, STEP_NAME, [item.id, next.id], "completed");
		}

		Some(completion)
	}

	/// Apply the completing rename to the incomplete event paths, and look at what is there.
	async fn rebuild(&self, item: &Event, next: &Event) -> Option<Completion> {
		let next_old_path = next.old_path.as_ref()?;
		let path = replace_prefix(&item.path, next_old_path, &next.path)?;

		let old_path = item.old_path.as_ref().map(|old_path| {
			if path == next.path {
				old_path.clone()
			} else {
				replace_prefix(old_path, next_old_path, &next.path).unwrap_or_else(|| old_path.clone())
			}
		});

		if old_path.as_ref() == Some(&path) {
			return Some(Completion::Ignored);
		}

		let absolute = self.config.absolute(&path);
		let stats = match stat_maybe(&absolute).await {
			Ok(stats) => stats,
			Err(e) => {
				warn!(?e, path = %path.display(), "Failed to stat rebuilt event path;");
				return None;
			}
		};

		let mut rebuilt = Event::new(item.action, item.kind, path);
		if let Some(old_path) = old_path {
			rebuilt = rebuilt.with_old_path(old_path);
		}

		let Some(stats) = stats else {
			return Some(Completion::Rebuilt(
				rebuilt.mark_incomplete(STEP_NAME, "not found at rebuilt path"),
			));
		};

		rebuilt = rebuilt.with_stats(stats);
		if rebuilt.kind == Kind::File {
			rebuilt = match self.hasher.hash(&absolute).await {
				Ok(md5sum) => rebuilt.with_md5sum(Some(md5sum)),
				Err(e) => rebuilt.mark_incomplete(STEP_NAME, e),
			};
		}

		Some(Completion::Rebuilt(rebuilt))
	}
}

fn was_renamed_successively(item: &Event, next: &Event) -> bool {
	next.old_path
		.as_ref()
		.is_some_and(|old_path| is_same_or_descendant(&item.path, old_path))
}

fn item_destination_was_deleted(item: &Event, next: &Event) -> bool {
	next.action == Action::Deleted
		&& item.old_path.is_some()
		&& is_same_or_descendant(&item.path, &next.path)
}

fn renamed_item_was_replaced(item: &Event, next: &Event) -> bool {
	next.action == Action::Created
		&& item.old_path.as_ref() == Some(&next.path)
		&& next.kind == item.kind
}

impl TimedStep for IncompleteFixer {
	const NAME: &'static str = STEP_NAME;

	fn next_deadline(&self) -> Option<Instant> {
		// Expired events are dropped when the next batch comes
		None
	}

	async fn on_batch(&mut self, batch: Batch, out: &Channel) {
		out.push(self.process(batch).await);
	}

	fn on_deadline(&mut self, _now: Instant, _out: &Channel) {}

	fn flush(&mut self, _out: &Channel) {
		if !self.incompletes.is_empty() {
			debug!(count = self.incompletes.len(), "Dropping incomplete events on stop");
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::{
		checksum::Md5Checksumer,
		store::DocKind,
		test_utils::{doc, expected, file, renamed, summaries, MemoryStore},
	};

	use std::{
		path::{Path, PathBuf},
		time::Duration,
	};

	use tokio::{fs, time::advance};

	use super::*;

	fn fixer(root: &Path, store: Arc<MemoryStore>) -> IncompleteFixer {
		IncompleteFixer::new(
			Arc::new(WatcherConfig::new(root)),
			store,
			Arc::new(Md5Checksumer::default()),
			Arc::new(AuditLog::default()),
		)
	}

	fn incomplete(action: Action, path: &str) -> Event {
		Event::new(action, Kind::File, path).mark_incomplete("add_checksum", "not found")
	}

	#[tokio::test]
	async fn file_written_then_moved_with_its_parent_is_rebuilt() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir(dir.path().join("dst")).await.unwrap();
		fs::write(dir.path().join("dst/file"), b"hello").await.unwrap();
		let mut fixer = fixer(dir.path(), MemoryStore::with_docs([]));

		assert!(fixer
			.process(vec![incomplete(Action::Created, "src/file")])
			.await
			.is_empty());

		let batch = fixer
			.process(vec![renamed(Kind::Directory, "src", "dst", 1)])
			.await;

		assert_eq!(
			summaries(&batch),
			[
				expected(Action::Renamed, "dst", Some("src")),
				expected(Action::Created, "dst/file", None),
			]
		);
		assert_eq!(batch[1].md5sum.as_deref(), Some("XUFAKrxLKna5cZ2REBfFkg=="));
	}

	#[tokio::test]
	async fn renamed_file_is_rebuilt_in_place_of_the_completing_event() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("final"), b"hello").await.unwrap();
		let mut fixer = fixer(dir.path(), MemoryStore::with_docs([]));

		fixer
			.process(vec![incomplete(Action::Renamed, "tmp").with_old_path("src")])
			.await;
		let batch = fixer
			.process(vec![renamed(Kind::File, "tmp", "final", 1)])
			.await;

		assert_eq!(
			summaries(&batch),
			[expected(Action::Renamed, "final", Some("src"))]
		);
	}

	#[tokio::test]
	async fn created_event_for_an_existing_document_is_dropped() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("dst"), b"hello").await.unwrap();
		let store = MemoryStore::with_docs([doc("src", DocKind::File, 1)]);
		let mut fixer = fixer(dir.path(), store);

		fixer.process(vec![incomplete(Action::Created, "src")]).await;
		let batch = fixer
			.process(vec![renamed(Kind::File, "src", "dst", 1)])
			.await;

		assert_eq!(
			summaries(&batch),
			[expected(Action::Renamed, "dst", Some("src"))]
		);
	}

	#[tokio::test]
	async fn deleted_destination_deletes_the_source() {
		let dir = tempfile::tempdir().unwrap();
		let mut fixer = fixer(dir.path(), MemoryStore::with_docs([]));

		fixer
			.process(vec![incomplete(Action::Renamed, "dir/dst").with_old_path("src")])
			.await;
		let batch = fixer
			.process(vec![Event::new(Action::Deleted, Kind::Directory, "dir")])
			.await;

		assert_eq!(
			summaries(&batch),
			[expected(Action::Deleted, "src", None)]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn incomplete_events_expire() {
		let mut fixer = fixer(Path::new("/sync"), MemoryStore::with_docs([]));

		fixer.process(vec![incomplete(Action::Created, "src/file")]).await;
		advance(Duration::from_secs(4)).await;

		let batch = fixer
			.process(vec![
				file(Action::Modified, "unrelated", 2),
				renamed(Kind::Directory, "src", "dst", 1),
			])
			.await;

		assert_eq!(
			summaries(&batch),
			[
				expected(Action::Modified, "unrelated", None),
				expected(Action::Renamed, "dst", Some("src")),
			]
		);
		assert!(fixer.incompletes.is_empty());
	}

	#[tokio::test]
	async fn modified_existing_document_keeps_both_events() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir(dir.path().join("dst")).await.unwrap();
		fs::write(dir.path().join("dst/file"), b"hello").await.unwrap();
		let store = MemoryStore::with_docs([doc("src/file", DocKind::File, 2)]);
		let mut fixer = fixer(dir.path(), store);

		fixer.process(vec![incomplete(Action::Modified, "src/file")]).await;
		let batch = fixer
			.process(vec![renamed(Kind::Directory, "src", "dst", 1)])
			.await;

		assert_eq!(
			summaries(&batch),
			[
				expected(Action::Renamed, "dst", Some("src")),
				expected(Action::Modified, "dst/file", None),
			]
		);
		assert_eq!(batch[1].md5sum.as_deref(), Some("XUFAKrxLKna5cZ2REBfFkg=="));
	}

	#[tokio::test]
	async fn creation_at_the_source_of_a_rename_is_a_modification() {
		let dir = tempfile::tempdir().unwrap();
		let mut fixer = fixer(dir.path(), MemoryStore::with_docs([]));

		fixer
			.process(vec![incomplete(Action::Renamed, "dst").with_old_path("src")])
			.await;
		let batch = fixer.process(vec![file(Action::Created, "src", 2)]).await;

		assert_eq!(summaries(&batch), [expected(Action::Modified, "src", None)]);
		assert!(fixer.incompletes.is_empty());
	}

	#[tokio::test]
	async fn renamed_back_to_its_source_cancels_both_events() {
		let dir = tempfile::tempdir().unwrap();
		let mut fixer = fixer(dir.path(), MemoryStore::with_docs([]));

		fixer
			.process(vec![incomplete(Action::Renamed, "tmp").with_old_path("a")])
			.await;
		let batch = fixer
			.process(vec![
				renamed(Kind::File, "tmp", "a", 1),
				file(Action::Modified, "other", 2),
			])
			.await;

		assert_eq!(summaries(&batch), [expected(Action::Modified, "other", None)]);
		assert!(fixer.incompletes.is_empty());
	}

	#[tokio::test]
	async fn rebuilt_events_still_missing_wait_for_the_next_rename() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir(dir.path().join("final")).await.unwrap();
		fs::write(dir.path().join("final/file"), b"hello").await.unwrap();
		let mut fixer = fixer(dir.path(), MemoryStore::with_docs([]));

		fixer.process(vec![incomplete(Action::Created, "src/file")]).await;

		let batch = fixer
			.process(vec![renamed(Kind::Directory, "src", "dst", 1)])
			.await;
		assert_eq!(
			summaries(&batch),
			[expected(Action::Renamed, "dst", Some("src"))]
		);
		assert_eq!(fixer.incompletes.len(), 1);

		let batch = fixer
			.process(vec![renamed(Kind::Directory, "dst", "final", 1)])
			.await;
		assert_eq!(
			summaries(&batch),
			[
				expected(Action::Renamed, "final", Some("dst")),
				expected(Action::Created, "final/file", None),
			]
		);
		assert!(fixer.incompletes.is_empty());
	}

	struct Scenario {
		name: &'static str,
		dirs: &'static [&'static str],
		files: &'static [&'static str],
		docs: &'static [(&'static str, DocKind)],
		incompletes: Vec<Event>,
		completing: Vec<Event>,
		expected: Vec<(Action, PathBuf, Option<PathBuf>)>,
	}

	/// Expected outputs for the ways the completion policies combine, in the order they apply.
	#[tokio::test]
	async fn completion_policies_regressions() {
		let scenarios = vec![
			Scenario {
				name: "existing created document only keeps the rename",
				dirs: &["dst"],
				files: &["dst/file"],
				docs: &[("src/file", DocKind::File)],
				incompletes: vec![incomplete(Action::Created, "src/file")],
				completing: vec![renamed(Kind::Directory, "src", "dst", 1)],
				expected: vec![expected(Action::Renamed, "dst", Some("src"))],
			},
			Scenario {
				name: "new file under a renamed folder keeps parent before child",
				dirs: &["dst"],
				files: &["dst/file"],
				docs: &[],
				incompletes: vec![incomplete(Action::Created, "src/file")],
				completing: vec![renamed(Kind::Directory, "src", "dst", 1)],
				expected: vec![
					expected(Action::Renamed, "dst", Some("src")),
					expected(Action::Created, "dst/file", None),
				],
			},
			Scenario {
				name: "renamed file replaces its completing rename",
				dirs: &[],
				files: &["final"],
				docs: &[],
				incompletes: vec![incomplete(Action::Renamed, "tmp").with_old_path("src")],
				completing: vec![renamed(Kind::File, "tmp", "final", 1)],
				expected: vec![expected(Action::Renamed, "final", Some("src"))],
			},
			Scenario {
				name: "several incompletes keep their arrival order",
				dirs: &["dst"],
				files: &["dst/a", "dst/b"],
				docs: &[],
				incompletes: vec![
					incomplete(Action::Created, "src/b"),
					incomplete(Action::Created, "src/a"),
				],
				completing: vec![renamed(Kind::Directory, "src", "dst", 1)],
				expected: vec![
					expected(Action::Renamed, "dst", Some("src")),
					expected(Action::Created, "dst/b", None),
					expected(Action::Created, "dst/a", None),
				],
			},
			Scenario {
				name: "deleted destination of a pending move",
				dirs: &[],
				files: &[],
				docs: &[],
				incompletes: vec![incomplete(Action::Renamed, "dir/dst").with_old_path("src")],
				completing: vec![Event::new(Action::Deleted, Kind::Directory, "dir")],
				expected: vec![expected(Action::Deleted, "src", None)],
			},
			Scenario {
				name: "unrelated events pass through untouched",
				dirs: &[],
				files: &[],
				docs: &[],
				incompletes: vec![incomplete(Action::Created, "src/file")],
				completing: vec![
					file(Action::Created, "elsewhere", 3),
					renamed(Kind::File, "x", "y", 4),
				],
				expected: vec![
					expected(Action::Created, "elsewhere", None),
					expected(Action::Renamed, "y", Some("x")),
				],
			},
		];

		for scenario in scenarios {
			let dir = tempfile::tempdir().unwrap();
			for sub in scenario.dirs {
				fs::create_dir_all(dir.path().join(sub)).await.unwrap();
			}
			for path in scenario.files {
				fs::write(dir.path().join(path), b"hello").await.unwrap();
			}
			let store = MemoryStore::with_docs(
				scenario
					.docs
					.iter()
					.zip(10..)
					.map(|((path, kind), ino)| doc(path, *kind, ino)),
			);
			let mut fixer = fixer(dir.path(), store);

			assert!(
				fixer.process(scenario.incompletes).await.is_empty(),
				"{}",
				scenario.name
			);
			let batch = fixer.process(scenario.completing).await;

			assert_eq!(summaries(&batch), scenario.expected, "{}", scenario.name);
		}
	}
}
