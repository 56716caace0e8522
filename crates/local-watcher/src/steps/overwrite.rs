//! A file replaced by another one, moved or created over it, is first notified as deleted.
//! Trashing it would lose its history on the remote side, so the deletion is ignored and the
//! event landing on its path is flagged as overwriting it instead.

use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	event::Action,
	provenance::AuditLog,
};

use std::{
	collections::{HashMap, VecDeque},
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

use super::TimedStep;

pub const STEP_NAME: &str = "overwrite";

#[derive(Debug)]
struct PendingBatch {
	events: Batch,
	deleted_by_path: HashMap<PathBuf, usize>,
	release_at: Instant,
}

pub struct Overwrite {
	delay: Duration,
	audit: Arc<AuditLog>,
	pending: VecDeque<PendingBatch>,
}

impl Overwrite {
	#[must_use]
	pub fn new(config: &WatcherConfig, audit: Arc<AuditLog>) -> Self {
		Self {
			delay: config.overwrite_delay(),
			audit,
			pending: VecDeque::new(),
		}
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		super::spawn_timed(self, input)
	}

	/// Flag events landing on the path of a held deletion, then hold the batch in turn.
	fn process(&mut self, mut events: Batch) {
		let mut deleted_by_path = HashMap::new();

		for idx in 0..events.len() {
			match events[idx].action {
				Action::Deleted => {
					deleted_by_path.insert(events[idx].path.clone(), idx);
				}
				Action::Renamed | Action::Created => {
					let path = events[idx].path.clone();

					let deleted = if let Some(deleted_idx) = deleted_by_path.remove(&path) {
						Some(&mut events[deleted_idx])
					} else {
						self.pending.iter_mut().find_map(|pending| {
							pending
								.deleted_by_path
								.remove(&path)
								.map(|deleted_idx| &mut pending.events[deleted_idx])
						})
					};

					let Some(deleted) = deleted else {
						continue;
					};

					let ignored = deleted.derive().with_action(Action::Ignored);
					self.audit
						.record(ignored.id, STEP_NAME, [deleted.id], "deleted before overwrite");
					*deleted = ignored;

					let overwriting = events[idx].derive().with_overwrite();
					self.audit
						.record(overwriting.id, STEP_NAME, [events[idx].id], "overwriting");
					debug!(
						path = %overwriting.path.display(),
						action = ?overwriting.action,
						"Overwriting a deleted entry",
					);
					events[idx] = overwriting;
				}
				_ => {}
			}
		}

		self.pending.push_back(PendingBatch {
			events,
			deleted_by_path,
			release_at: Instant::now() + self.delay,
		});
	}

	/// Release leading batches without any deletion left to be overwritten.
	fn send_ready(&mut self, out: &Channel) {
		while self
			.pending
			.front()
			.is_some_and(|pending| pending.deleted_by_path.is_empty())
		{
			if let Some(pending) = self.pending.pop_front() {
				out.push(pending.events);
			}
		}
	}
}

impl TimedStep for Overwrite {
	const NAME: &'static str = STEP_NAME;

	fn next_deadline(&self) -> Option<Instant> {
		self.pending.front().map(|pending| pending.release_at)
	}

	async fn on_batch(&mut self, batch: Batch, out: &Channel) {
		self.process(batch);
		self.send_ready(out);
	}

	fn on_deadline(&mut self, now: Instant, out: &Channel) {
		while self
			.pending
			.front()
			.is_some_and(|pending| pending.release_at <= now)
		{
			if let Some(pending) = self.pending.pop_front() {
				out.push(pending.events);
			}
		}
		self.send_ready(out);
	}

	fn flush(&mut self, out: &Channel) {
		for pending in self.pending.drain(..) {
			out.push(pending.events);
		}
	}
}
