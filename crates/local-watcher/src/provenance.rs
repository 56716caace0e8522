use crate::event::EventId;

use std::collections::VecDeque;

use parking_lot::Mutex;

const DEFAULT_CAPACITY: usize = 4096;

/// What a step did to build an event, kept aside from the event itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
	pub event: EventId,
	pub step: &'static str,
	/// Events this one was derived from, oldest first.
	pub parents: Vec<EventId>,
	pub note: &'static str,
}

/// Bounded in-memory log of how events were transformed along the pipeline.
#[derive(Debug)]
pub struct AuditLog {
	records: Mutex<VecDeque<AuditRecord>>,
	capacity: usize,
}

impl Default for AuditLog {
	fn default() -> Self {
		Self::with_capacity(DEFAULT_CAPACITY)
	}
}

impl AuditLog {
	#[must_use]
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
			capacity: capacity.max(1),
		}
	}

	pub fn record(
		&self,
		event: EventId,
		step: &'static str,
		parents: impl IntoIterator<Item = EventId>,
		note: &'static str,
	) {
		let mut records = self.records.lock();
		if records.len() == self.capacity {
			records.pop_front();
		}
		records.push_back(AuditRecord {
			event,
			step,
			parents: parents.into_iter().collect(),
			note,
		});
	}

	/// Records about a single event, in the order they were made.
	#[must_use]
	pub fn history(&self, event: EventId) -> Vec<AuditRecord> {
		self.records
			.lock()
			.iter()
			.filter(|record| record.event == event)
			.cloned()
			.collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.records.lock().is_empty()
	}
}
