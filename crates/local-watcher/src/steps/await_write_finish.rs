//! Debounce file writes, so the content of a file being written is only hashed once it is
//! done. Temporary files created then deleted quickly never leave this step.

use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	event::{Action, Event},
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

pub const STEP_NAME: &str = "await_write_finish";

#[derive(Debug)]
struct Waiting {
	events: Batch,
	/// Events still able to absorb a later write on the same file.
	candidates: usize,
	release_at: Instant,
}

pub struct AwaitWriteFinish {
	delay: Duration,
	audit: Arc<AuditLog>,
	waiting: VecDeque<Waiting>,
}

impl AwaitWriteFinish {
	#[must_use]
	pub fn new(config: &WatcherConfig, audit: Arc<AuditLog>) -> Self {
		Self {
			delay: config.await_write_finish_delay(),
			audit,
			waiting: VecDeque::new(),
		}
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		super::spawn_timed(self, input)
	}

	/// Merge writes on the same file within a single batch.
	fn aggregate_batch(&self, events: Batch) -> Batch {
		let mut aggregated: Vec<Option<Event>> = Vec::with_capacity(events.len());
		let mut last_writes = HashMap::<PathBuf, usize>::new();

		for event in events {
			let last_write = last_writes.get(&event.path).copied().filter(|&idx| {
				aggregated[idx]
					.as_ref()
					.is_some_and(|last_write| is_aggregation_candidate(&event, last_write))
			});

			match last_write {
				Some(idx) => {
					if let Some(last_write) = aggregated[idx].take() {
						let last_write_path = last_write.path.clone();
						aggregated[idx] = self.aggregate(last_write, event);
						if aggregated[idx].is_none() {
							last_writes.remove(&last_write_path);
						}
					}
				}
				None => {
					if is_write(&event) {
						last_writes.insert(event.path.clone(), aggregated.len());
					}
					aggregated.push(Some(event));
				}
			}
		}

		aggregated.into_iter().flatten().collect()
	}

	/// Result of a write following another one on the same file, if anything is left.
	fn aggregate(&self, old: Event, recent: Event) -> Option<Event> {
		let aggregated = match (old.action, recent.action) {
			(Action::Created, Action::Deleted) => {
				debug!(path = %recent.path.display(), "Ignoring file created then deleted");
				return None;
			}
			(Action::Renamed, Action::Deleted) => {
				// Delete the document at its old path instead of moving then trashing it
				let path = old.old_path.clone().unwrap_or_else(|| recent.path.clone());
				recent.derive().with_path(path)
			}
			(_, Action::Modified) => {
				// The first action matters more, it can be a creation
				let mut merged = recent.derive().with_action(old.action);
				if old.action == Action::Renamed {
					merged.old_path = old.old_path.clone();
				}
				if old.action == Action::Deleted {
					merged = merged.without_stats();
				}
				merged
			}
			_ => recent.derive(),
		};

		self.audit
			.record(aggregated.id, STEP_NAME, [old.id, recent.id], "aggregated writes");

		Some(aggregated)
	}

	/// Merge writes with the ones of waiting batches, dropping the events fully absorbed.
	fn debounce(&mut self, events: Batch) -> Batch {
		let mut debounced = Batch::with_capacity(events.len());

		for event in events {
			if event.is_incomplete()
				|| !event.is_file()
				|| !matches!(event.action, Action::Modified | Action::Deleted)
			{
				debounced.push(event);
				continue;
			}

			let previous = self
				.waiting
				.iter_mut()
				.filter(|waiting| waiting.candidates > 0)
				.find_map(|waiting| {
					waiting
						.events
						.iter()
						.position(|e| {
							e.path == event.path
								&& (matches!(e.action, Action::Created | Action::Modified)
									|| (e.action == Action::Renamed
										&& e.identity() == event.identity()))
						})
						.map(|idx| {
							waiting.candidates -= 1;
							waiting.events.remove(idx)
						})
				});

			match previous {
				Some(previous) => {
					if let Some(merged) = self.aggregate(previous, event) {
						debounced.push(merged);
					}
				}
				None => debounced.push(event),
			}
		}

		debounced
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

/// Complete file event able to start or continue a chain of writes.
fn is_write(event: &Event) -> bool {
	!event.is_incomplete()
		&& event.is_file()
		&& matches!(
			event.action,
			Action::Created | Action::Modified | Action::Deleted | Action::Renamed
		)
}

fn is_aggregation_candidate(event: &Event, last_write: &Event) -> bool {
	is_write(event)
		&& (last_write.action != Action::Renamed || event.identity() == last_write.identity())
}

fn count_candidates(events: &[Event]) -> usize {
	events
		.iter()
		.filter(|event| {
			!event.is_incomplete()
				&& event.is_file()
				&& matches!(
					event.action,
					Action::Created | Action::Modified | Action::Renamed
				)
		})
		.count()
}

impl TimedStep for AwaitWriteFinish {
	const NAME: &'static str = STEP_NAME;

	fn next_deadline(&self) -> Option<Instant> {
		self.waiting.front().map(|waiting| waiting.release_at)
	}

	async fn on_batch(&mut self, batch: Batch, out: &Channel) {
		let events = self.aggregate_batch(batch);
		let candidates = count_candidates(&events);
		let events = self.debounce(events);

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
