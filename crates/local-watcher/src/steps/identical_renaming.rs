//! Renaming `foo` to `FOO` on a case insensitive file system is reported as a rename from and
//! to the same path, sometimes preceded by a bogus deletion of that same path.
//!
//! The old path is fixed from the document store and the bogus deletion is ignored. Deletions
//! are held a little in case their rename shows up in the next batch.

use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	event::{Action, Event},
	provenance::AuditLog,
	store::{DocId, DocumentStore},
};

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, warn};

use super::TimedStep;

pub const STEP_NAME: &str = "identical_renaming";

pub struct IdenticalRenaming {
	delay: Duration,
	store: Arc<dyn DocumentStore>,
	audit: Arc<AuditLog>,
	pending: Batch,
	release_at: Option<Instant>,
}

impl IdenticalRenaming {
	#[must_use]
	pub fn new(config: &WatcherConfig, store: Arc<dyn DocumentStore>, audit: Arc<AuditLog>) -> Self {
		Self {
			delay: config.identical_renaming_delay(),
			store,
			audit,
			pending: Batch::new(),
			release_at: None,
		}
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		super::spawn_timed(self, input)
	}

	async fn fix_old_path(&self, event: Event) -> Event {
		if event.old_path.as_ref() != Some(&event.path) {
			return event;
		}

		match self.store.by_local_path(&event.path).await {
			Ok(Some(doc)) if !doc.trashed && doc.path != event.path => {
				let fixed = event.derive().with_old_path(doc.path);
				debug!(
					path = %fixed.path.display(),
					old_path = ?fixed.old_path,
					"Fixed identical renaming old path",
				);
				self.audit
					.record(fixed.id, STEP_NAME, [event.id], "old path from document");
				fixed
			}
			Ok(_) => event,
			Err(e) => {
				warn!(?e, path = %event.path.display(), "Failed to look up renamed document;");
				event
			}
		}
	}

	fn ignore_deleted_before(&mut self, renamed: &Event, current: &mut [Event]) {
		let id = DocId::from_path(&renamed.path);

		let deleted = current
			.iter_mut()
			.chain(self.pending.iter_mut())
			.find(|event| event.action == Action::Deleted && DocId::from_path(&event.path) == id);

		if let Some(deleted) = deleted {
			let ignored = deleted.derive().with_action(Action::Ignored);
			self.audit.record(
				ignored.id,
				STEP_NAME,
				[deleted.id, renamed.id],
				"deleted before identical renaming",
			);
			*deleted = ignored;
		}
	}
}

impl TimedStep for IdenticalRenaming {
	const NAME: &'static str = STEP_NAME;

	fn next_deadline(&self) -> Option<Instant> {
		self.release_at
	}

	async fn on_batch(&mut self, events: Batch, out: &Channel) {
		let mut batch = Batch::with_capacity(events.len());

		for event in events {
			if event.action == Action::Renamed {
				let event = self.fix_old_path(event).await;
				self.ignore_deleted_before(&event, &mut batch);
				batch.push(event);
			} else {
				batch.push(event);
			}
		}

		let held = batch
			.iter()
			.position(|event| event.action == Action::Deleted)
			.map(|first_deleted| batch.split_off(first_deleted))
			.unwrap_or_default();

		let mut released = std::mem::take(&mut self.pending);
		released.append(&mut batch);
		out.push(released);

		self.release_at = (!held.is_empty()).then(|| Instant::now() + self.delay);
		self.pending = held;
	}

	fn on_deadline(&mut self, _now: Instant, out: &Channel) {
		self.release_at = None;
		out.push(std::mem::take(&mut self.pending));
	}

	fn flush(&mut self, out: &Channel) {
		self.on_deadline(Instant::now(), out);
	}
}

#[cfg(test)]
mod tests {
	use crate::{
		event::Kind,
		store::DocKind,
		test_utils::{deleted, doc, expected, file, next_batch, renamed, summaries, MemoryStore},
	};

	use super::*;

	fn spawn(store: Arc<MemoryStore>) -> (Channel, Channel) {
		let input = Channel::new();
		let out = IdenticalRenaming::new(
			&WatcherConfig::default(),
			store,
			Arc::new(AuditLog::default()),
		)
		.spawn(input.clone());
		(input, out)
	}

	#[tokio::test(start_paused = true)]
	async fn old_path_is_fixed_from_the_document() {
		let mut foo = doc("foo", DocKind::File, 1);
		foo.id = DocId::from_path("FOO");
		let (input, out) = spawn(MemoryStore::with_docs([foo]));

		input.push(vec![
			renamed(Kind::File, "FOO", "FOO", 1),
			renamed(Kind::File, "bar", "bar", 2),
		]);
		assert_eq!(
			summaries(&next_batch(&out).await),
			[
				expected(Action::Renamed, "FOO", Some("foo")),
				expected(Action::Renamed, "bar", Some("bar")),
			]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn deletions_are_held_until_the_next_batch() {
		let (input, out) = spawn(MemoryStore::with_docs([]));

		input.push(vec![
			file(Action::Created, "a", 1),
			deleted(Kind::File, "b", Some(2)),
			file(Action::Created, "c", 3),
		]);
		assert_eq!(
			summaries(&next_batch(&out).await),
			[expected(Action::Created, "a", None)]
		);

		input.push(vec![renamed(Kind::File, "b", "b", 2)]);
		assert_eq!(
			summaries(&next_batch(&out).await),
			[
				expected(Action::Ignored, "b", None),
				expected(Action::Created, "c", None),
				expected(Action::Renamed, "b", Some("b")),
			]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn held_deletions_are_released_after_the_delay() {
		let (input, out) = spawn(MemoryStore::with_docs([]));

		input.push(vec![deleted(Kind::File, "b", Some(2))]);

		let started = Instant::now();
		assert_eq!(
			summaries(&next_batch(&out).await),
			[expected(Action::Deleted, "b", None)]
		);
		assert!(started.elapsed() >= Duration::from_millis(500));
	}
}
