//! Backends unable to report moves notify a deletion and a creation instead. Both halves are
//! matched by file identity and aggregated into a single `renamed` event.
//!
//! Deletions whose identity is known are held until their creation shows up, or until they
//! expire. Events behind them wait too, so the output order matches the input one.

use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	error::Error,
	event::{is_same_or_descendant, replace_prefix, Action, Event, Identity},
	provenance::AuditLog,
	store::{DocId, DocumentStore},
};

use std::{
	collections::VecDeque,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::TimedStep;

pub const STEP_NAME: &str = "detect_move";

#[derive(Debug)]
struct Pending {
	event: Event,
	/// Identity of a deleted entry, making this item wait for its creation.
	deleted_identity: Option<Identity>,
	release_at: Instant,
}

#[derive(Debug)]
struct RecentRename {
	old_path: PathBuf,
	path: PathBuf,
	at: Instant,
}

pub struct DetectMove {
	delay: Duration,
	recent_window: Duration,
	store: Arc<dyn DocumentStore>,
	audit: Arc<AuditLog>,
	pending: VecDeque<Pending>,
	recent_renames: VecDeque<RecentRename>,
}

impl DetectMove {
	#[must_use]
	pub fn new(config: &WatcherConfig, store: Arc<dyn DocumentStore>, audit: Arc<AuditLog>) -> Self {
		Self {
			delay: config.detect_move_delay(),
			recent_window: config.recent_renames_window(),
			store,
			audit,
			pending: VecDeque::new(),
			recent_renames: VecDeque::new(),
		}
	}

	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		super::spawn_timed(self, input)
	}

	/// Paths the deleted path had before the recent renames of its ancestors, most recent
	/// rename last.
	fn previous_paths(&self, deleted_path: &Path) -> Vec<PathBuf> {
		let mut current = deleted_path.to_path_buf();
		let mut previous = Vec::new();

		for rename in self.recent_renames.iter().rev() {
			if !is_same_or_descendant(&current, &rename.path) {
				continue;
			}
			if let Some(path) = replace_prefix(&current, &rename.path, &rename.old_path) {
				current = path;
				previous.insert(0, current.clone());
			}
		}

		previous
	}

	/// Renames already merged are known by the store, they must not translate paths anymore.
	async fn forget_merged_renames(&mut self) -> Result<(), Error> {
		let mut kept = VecDeque::with_capacity(self.recent_renames.len());

		for rename in std::mem::take(&mut self.recent_renames) {
			let merged = self
				.store
				.by_id(&DocId::from_path(&rename.path))
				.await?
				.is_some_and(|doc| doc.path == rename.path);

			if merged {
				trace!(path = %rename.path.display(), "Forgetting merged rename");
			} else {
				kept.push_back(rename);
			}
		}

		self.recent_renames = kept;

		Ok(())
	}

	async fn resolve_deleted_identity(&mut self, event: &Event) -> Result<Option<Identity>, Error> {
		if let Some(identity) = &event.deleted_ino {
			return Ok(Some(identity.clone()));
		}

		let _lock = self.store.lock(STEP_NAME).await?;

		if let Some(doc) = self.store.by_id(&DocId::from_path(&event.path)).await? {
			return Ok(doc.identity());
		}

		self.forget_merged_renames().await?;

		for previous_path in self.previous_paths(&event.path) {
			if let Some(doc) = self.store.by_id(&DocId::from_path(&previous_path)).await? {
				trace!(
					path = %event.path.display(),
					previous_path = %previous_path.display(),
					"Resolved deleted identity through a recent rename",
				);
				return Ok(doc.identity());
			}
		}

		debug!(path = %event.path.display(), "Unresolved deleted identity");
		Ok(None)
	}

	/// A single event out of the deletion and creation of the same entry.
	fn aggregate(&mut self, created: &Event, deleted: &Event) -> Event {
		let aggregated = if created.path == deleted.path {
			created.derive().with_action(Action::Ignored)
		} else {
			self.recent_renames.push_back(RecentRename {
				old_path: deleted.path.clone(),
				path: created.path.clone(),
				at: Instant::now(),
			});
			created
				.derive()
				.with_action(Action::Renamed)
				.with_old_path(deleted.path.clone())
		};

		debug!(
			path = %aggregated.path.display(),
			old_path = %deleted.path.display(),
			action = ?aggregated.action,
			"Aggregated deletion and creation",
		);
		self.audit.record(
			aggregated.id,
			STEP_NAME,
			[deleted.id, created.id],
			"deleted then created",
		);

		aggregated
	}

	async fn handle_event(&mut self, event: Event) {
		let release_at = Instant::now() + self.delay;

		match event.action {
			Action::Deleted => {
				let deleted_identity = match self.resolve_deleted_identity(&event).await {
					Ok(identity) => identity,
					Err(e) => {
						warn!(?e, path = %event.path.display(), "Failed to resolve deleted identity;");
						None
					}
				};

				let created_idx = deleted_identity.as_ref().and_then(|identity| {
					self.pending.iter().position(|pending| {
						pending.event.action == Action::Created
							&& !pending.event.is_incomplete()
							&& pending.event.stats_identity() == Some(identity)
					})
				});

				let created = created_idx
					.and_then(|idx| self.pending.remove(idx).map(|created| (idx, created)));

				if let Some((idx, created)) = created {
					// Takes the place of the creation, which was already waiting
					let aggregated = self.aggregate(&created.event, &event);
					self.pending.insert(
						idx,
						Pending {
							event: aggregated,
							deleted_identity: None,
							release_at: created.release_at,
						},
					);
				} else {
					self.pending.push_back(Pending {
						event,
						deleted_identity,
						release_at,
					});
				}
			}

			Action::Created if !event.is_incomplete() => {
				let deleted_idx = event.stats_identity().and_then(|identity| {
					self.pending
						.iter()
						.position(|pending| pending.deleted_identity.as_ref() == Some(identity))
				});

				let event = match deleted_idx.and_then(|idx| self.pending.remove(idx)) {
					Some(deleted) => self.aggregate(&event, &deleted.event),
					None => event,
				};

				self.pending.push_back(Pending {
					event,
					deleted_identity: None,
					release_at,
				});
			}

			_ => self.pending.push_back(Pending {
				event,
				deleted_identity: None,
				release_at,
			}),
		}
	}

	/// Release leading items not waiting for anything.
	fn release_ready(&mut self, released: &mut Batch) {
		while self
			.pending
			.front()
			.is_some_and(|pending| pending.deleted_identity.is_none())
		{
			if let Some(pending) = self.pending.pop_front() {
				released.push(pending.event);
			}
		}
	}

	fn forget_old_renames(&mut self, now: Instant) {
		while self
			.recent_renames
			.front()
			.is_some_and(|rename| now.duration_since(rename.at) > self.recent_window)
		{
			self.recent_renames.pop_front();
		}
	}
}

impl TimedStep for DetectMove {
	const NAME: &'static str = STEP_NAME;

	fn next_deadline(&self) -> Option<Instant> {
		self.pending.front().map(|pending| pending.release_at)
	}

	async fn on_batch(&mut self, batch: Batch, out: &Channel) {
		self.forget_old_renames(Instant::now());

		for event in batch {
			self.handle_event(event).await;
		}

		let mut released = Batch::new();
		self.release_ready(&mut released);
		out.push(released);
	}

	fn on_deadline(&mut self, now: Instant, out: &Channel) {
		let mut released = Batch::new();

		while self
			.pending
			.front()
			.is_some_and(|pending| pending.release_at <= now)
		{
			if let Some(pending) = self.pending.pop_front() {
				released.push(pending.event);
			}
			self.release_ready(&mut released);
		}

		out.push(released);
	}

	fn flush(&mut self, out: &Channel) {
		out.push(self.pending.drain(..).map(|pending| pending.event).collect());
	}
}
