//! Entries may have been moved, replaced or deleted while the watcher was stopped. Events of
//! the initial scan are compared to the known documents, matched by identity: moves are
//! reported as such, and documents never seen by the scan are reported deleted once it is over.

use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	event::{is_strict_descendant, replace_prefix, Action, Event, Identity},
	provenance::AuditLog,
	store::{Document, DocumentStore},
};

use std::{
	collections::{HashMap, HashSet, VecDeque},
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::TimedStep;

pub const STEP_NAME: &str = "initial_diff";

#[derive(Debug)]
struct Waiting {
	events: Batch,
	/// Renames that a later scan of the same path may still overlap.
	candidates: usize,
	release_at: Instant,
}

#[derive(Debug, Default)]
struct Diff {
	by_identity: HashMap<Identity, Document>,
	/// Renames seen so far, as `(old_path, path)`.
	renames: Vec<(PathBuf, PathBuf)>,
	scanned: HashSet<PathBuf>,
}

pub struct InitialDiff {
	delay: Duration,
	store: Arc<dyn DocumentStore>,
	audit: Arc<AuditLog>,
	diff: Option<Diff>,
	done: bool,
	waiting: VecDeque<Waiting>,
}

impl InitialDiff {
	#[must_use]
	pub fn new(config: &WatcherConfig, store: Arc<dyn DocumentStore>, audit: Arc<AuditLog>) -> Self {
		Self {
			delay: config.initial_diff_delay(),
			store,
			audit,
			diff: None,
			done: false,
			waiting: VecDeque::new(),
		}
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		super::spawn_timed(self, input)
	}

	async fn load(&self) -> Diff {
		let docs = match self.store.tree().await {
			Ok(docs) => docs,
			Err(e) => {
				warn!(?e, "Failed to load known documents, deletions while stopped won't be detected;");
				Vec::new()
			}
		};

		// Only documents created locally or already synchronized have an identity
		let by_identity = docs
			.into_iter()
			.filter_map(|doc| doc.identity().map(|identity| (identity, doc)))
			.collect::<HashMap<_, _>>();

		debug!(count = by_identity.len(), "Loaded known documents");

		Diff {
			by_identity,
			..Default::default()
		}
	}

	/// Drop scans overlapping a held rename, which already stands for them.
	fn debounce(&mut self, events: Batch) -> Batch {
		events
			.into_iter()
			.filter(|event| {
				if event.is_incomplete() || event.action != Action::Scan {
					return true;
				}

				let overlapping = self
					.waiting
					.iter_mut()
					.filter(|waiting| waiting.candidates > 0)
					.find(|waiting| {
						waiting
							.events
							.iter()
							.any(|e| e.action == Action::Renamed && e.path == event.path)
					});

				if let Some(waiting) = overlapping {
					debug!(path = %event.path.display(), "Ignoring overlapping scan");
					waiting.candidates -= 1;
					return false;
				}

				true
			})
			.collect()
	}

	fn diff_batch(&mut self, diff: &mut Diff, events: Batch) -> (Batch, usize) {
		let mut batch = Batch::with_capacity(events.len());
		let mut candidates = 0;

		for event in events {
			if event.is_incomplete() {
				batch.push(event);
				continue;
			}

			let mut event = event;

			if matches!(event.action, Action::Created | Action::Scan) {
				let was = event
					.stats_identity()
					.and_then(|identity| diff.by_identity.get(identity))
					.cloned();

				if let Some(was) = was {
					if was
						.move_from
						.as_ref()
						.is_some_and(|move_from| move_from.path == event.path)
					{
						event = self.derive(&event, Action::Ignored, "move not applied yet");
					} else if was.path != event.path {
						if was.event_kind() == event.kind {
							let renamed = self
								.derive(&event, Action::Renamed, "moved while stopped")
								.with_old_path(was.path.clone());
							event = renamed;
							candidates += 1;
						} else {
							// The inode of a deleted entry was reused for another kind of entry
							let deleted = Event::new(Action::Deleted, was.event_kind(), was.path.clone())
								.with_deleted_ino(was.identity());
							self.audit
								.record(deleted.id, STEP_NAME, [event.id], "identity reused");
							batch.push(deleted);
						}
					} else if is_untouched_file(&event, &was) {
						event = event.with_md5sum(was.md5sum.clone());
					}
				}
			}

			if matches!(
				event.action,
				Action::Created | Action::Modified | Action::Renamed | Action::Scan | Action::Ignored
			) {
				if let Some(identity) = event.stats_identity() {
					diff.by_identity.remove(identity);
				}
				diff.scanned.insert(event.path.clone());
			}

			let event = self.fix_paths_after_parent_move(&diff.renames, event);

			if event.action == Action::Renamed {
				if let Some(old_path) = &event.old_path {
					diff.renames.push((old_path.clone(), event.path.clone()));
				}
			}

			if event.action == Action::InitialScanDone {
				let mut remaining = diff.by_identity.drain().map(|(_, doc)| doc).collect::<Vec<_>>();
				remaining.sort_by(|a, b| a.path.cmp(&b.path));

				for doc in remaining {
					let deleted = Event::new(Action::Deleted, doc.event_kind(), doc.path.clone())
						.with_deleted_ino(doc.identity());
					let deleted = self.fix_paths_after_parent_move(&diff.renames, deleted);

					if !diff.scanned.contains(&deleted.path) {
						debug!(path = %deleted.path.display(), "Deleted while stopped");
						self.audit
							.record(deleted.id, STEP_NAME, [event.id], "not found by initial scan");
						batch.push(deleted);
					}
				}

				info!("Initial diff done");
				self.done = true;
			}

			batch.push(event);
		}

		(batch, candidates)
	}

	fn derive(&self, event: &Event, action: Action, note: &'static str) -> Event {
		let derived = event.derive().with_action(action);
		debug!(path = %derived.path.display(), action = ?action, note, "Initial diff");
		self.audit.record(derived.id, STEP_NAME, [event.id], note);
		derived
	}

	/// Events about entries under a folder moved while stopped still use the old folder path.
	fn fix_paths_after_parent_move(&self, renames: &[(PathBuf, PathBuf)], event: Event) -> Event {
		let parent = event.id;
		let mut event = event;
		let mut fixed = false;

		for (renamed_old_path, renamed_path) in renames {
			if let Some(old_path) = event
				.old_path
				.as_ref()
				.filter(|old_path| is_strict_descendant(old_path, renamed_old_path))
				.and_then(|old_path| replace_prefix(old_path, renamed_old_path, renamed_path))
			{
				event = if event.path == old_path {
					// Moved along with its parent only
					event.with_action(Action::Scan).without_old_path()
				} else {
					event.with_old_path(old_path)
				};
				fixed = true;
			}

			if let Some(path) = Some(&event.path)
				.filter(|path| is_strict_descendant(path, renamed_old_path))
				.and_then(|path| replace_prefix(path, renamed_old_path, renamed_path))
			{
				if event.old_path.as_ref() != Some(&path) {
					event = event.with_path(path);
				}
				fixed = true;
			}
		}

		if fixed {
			let event = event.derive();
			self.audit
				.record(event.id, STEP_NAME, [parent], "path fixed after parent move");
			event
		} else {
			event
		}
	}

	fn send_ready(&mut self, out: &Channel) {
		while self
			.waiting
			.front()
			.is_some_and(|waiting| waiting.candidates == 0)
		{
			if let Some(waiting) = self.waiting.pop_front() {
				out.push(waiting.events);
			}
		}
	}
}

fn is_untouched_file(event: &Event, was: &Document) -> bool {
	was.md5sum.is_some()
		&& event.is_file()
		&& event
			.stats
			.as_ref()
			.is_some_and(|stats| stats.update_time() == was.updated_at)
}

impl TimedStep for InitialDiff {
	const NAME: &'static str = STEP_NAME;

	fn next_deadline(&self) -> Option<Instant> {
		self.waiting.front().map(|waiting| waiting.release_at)
	}

	async fn on_batch(&mut self, batch: Batch, out: &Channel) {
		let events = self.debounce(batch);

		let (events, candidates) = if self.done {
			(events, 0)
		} else {
			let mut diff = match self.diff.take() {
				Some(diff) => diff,
				None => self.load().await,
			};
			let diffed = self.diff_batch(&mut diff, events);
			if !self.done {
				self.diff = Some(diff);
			}
			diffed
		};

		self.waiting.push_back(Waiting {
			events,
			candidates,
			release_at: Instant::now() + self.delay,
		});

		self.send_ready(out);
	}

	fn on_deadline(&mut self, _now: Instant, out: &Channel) {
		if let Some(waiting) = self.waiting.pop_front() {
			out.push(waiting.events);
		}
		self.send_ready(out);
	}

	fn flush(&mut self, out: &Channel) {
		for waiting in self.waiting.drain(..) {
			out.push(waiting.events);
		}
	}
}
