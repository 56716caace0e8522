use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	error::Error,
	event::{Action, Event, Kind},
	signals::{Signals, WatcherSignal},
	steps::{spawn_timed, TimedStep},
	store::{Document, DocumentStore, LocalDocument, Merge, Side},
};

use std::{path::Path, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

pub const STEP_NAME: &str = "dispatch";

const SIDE: Side = Side::Local;

/// End of the pipeline, turning every finished event into a merge call.
///
/// Merge calls are made while holding the document store lock, one event at a time. A failed
/// call is logged and the next events are dispatched anyway.
pub struct Dispatcher {
	store: Arc<dyn DocumentStore>,
	merge: Arc<dyn Merge>,
	signals: Signals,
	local_end_delay: Duration,
	local_end_at: Option<Instant>,
}

impl Dispatcher {
	#[must_use]
	pub fn new(
		config: &WatcherConfig,
		store: Arc<dyn DocumentStore>,
		merge: Arc<dyn Merge>,
		signals: Signals,
	) -> Self {
		Self {
			store,
			merge,
			signals,
			local_end_delay: config.local_end_delay(),
			local_end_at: None,
		}
	}

	/// Nothing is ever pushed to the returned channel, which is closed once every batch of the
	/// input was dispatched.
	#[must_use]
	pub fn spawn(self, input: Channel) -> Channel {
		spawn_timed(self, input)
	}

	async fn dispatch_event(&self, event: &Event) -> Result<(), Error> {
		trace!(?event, "dispatch");

		match event.action {
			Action::InitialScanDone => {
				info!("Initial scan done");
				self.signals.emit(WatcherSignal::InitialScanDone);
			}

			Action::Ignored => debug!(path = %event.path.display(), "Ignored"),

			_ => {
				let _lock = self.store.lock(STEP_NAME).await?;

				self.apply(event).await?;

				match self.store.changes_sequence().await {
					Ok(seq) => self.signals.emit(WatcherSignal::SyncTarget(seq)),
					Err(e) => error!(?e, "Failed to get the changes sequence;"),
				}
			}
		}

		Ok(())
	}

	async fn apply(&self, event: &Event) -> Result<(), Error> {
		match (event.action, event.kind) {
			(Action::Scan | Action::Created, Kind::File) => self.add_file(event).await,

			(Action::Scan | Action::Created, Kind::Directory) => self.put_folder(event).await,

			(Action::Modified, Kind::File) => {
				debug!(path = %event.path.display(), "File modified");
				self.merge.update_file(SIDE, file_doc(event)).await
			}

			(Action::Modified, Kind::Directory) => {
				debug!(path = %event.path.display(), "Dir modified");
				self.merge.put_folder(SIDE, folder_doc(event)).await
			}

			(Action::Renamed, Kind::File | Kind::Directory) => self.renamed(event).await,

			(Action::Deleted, Kind::File | Kind::Directory) => self.deleted(event).await,

			(_, Kind::Symlink | Kind::Unknown) => {
				warn!(path = %event.path.display(), kind = ?event.kind, "Could not dispatch event of unsupported kind;");
				Ok(())
			}

			(Action::InitialScanDone | Action::Ignored, _) => Ok(()),
		}
	}

	async fn add_file(&self, event: &Event) -> Result<(), Error> {
		debug!(path = %event.path.display(), action = ?event.action, "File added");
		self.merge.add_file(SIDE, file_doc(event)).await
	}

	async fn put_folder(&self, event: &Event) -> Result<(), Error> {
		debug!(path = %event.path.display(), action = ?event.action, "Dir added");
		self.merge.put_folder(SIDE, folder_doc(event)).await
	}

	async fn renamed(&self, event: &Event) -> Result<(), Error> {
		let Some(old_path) = &event.old_path else {
			warn!(path = %event.path.display(), "Renamed event without old path;");
			return Ok(());
		};

		let Some(was) = self.store.by_local_path(old_path).await? else {
			if self.was_already_moved(old_path, &event.path).await {
				debug!(path = %event.path.display(), "Assuming already moved");
				return Ok(());
			}

			debug!(path = %event.path.display(), "Moved without source document, assuming added");
			return if event.kind == Kind::File {
				self.add_file(event).await
			} else {
				self.put_folder(event).await
			};
		};

		if let (Some(was_identity), Some(identity)) = (was.identity(), event.identity()) {
			if &was_identity != identity {
				warn!(
					path = %event.path.display(),
					old_path = %old_path.display(),
					%was_identity,
					%identity,
					"Move source has been replaced in the document store;",
				);
				return Ok(());
			}
		}

		let mut doc = if event.kind == Kind::File {
			file_doc(event)
		} else {
			folder_doc(event)
		};
		if event.overwrite {
			doc.overwrite = self.store.by_local_path(&event.path).await?;
		}

		if event.kind == Kind::File {
			debug!(path = %event.path.display(), old_path = %old_path.display(), "File moved");
			self.merge.move_file(SIDE, doc, was).await
		} else {
			debug!(path = %event.path.display(), old_path = %old_path.display(), "Dir moved");
			self.merge.move_folder(SIDE, doc, was).await
		}
	}

	async fn deleted(&self, event: &Event) -> Result<(), Error> {
		let was = match self.store.by_local_path(&event.path).await? {
			Some(was) if !was.trashed => was,
			_ => {
				debug!(path = %event.path.display(), "Assuming already removed");
				return Ok(());
			}
		};

		if was.event_kind() == Kind::Directory {
			debug!(path = %event.path.display(), "Dir removed");
			self.merge.trash_folder(SIDE, was).await
		} else {
			debug!(path = %event.path.display(), "File removed");
			self.merge.trash_file(SIDE, was).await
		}
	}

	/// Whether the synchronization itself applied this move, after which the source document
	/// is gone and the previous revision of the destination one remembers where it came from.
	async fn was_already_moved(&self, src: &Path, dst: &Path) -> bool {
		let existing: Option<Document> = match self.store.by_local_path(dst).await {
			Ok(existing) => existing,
			Err(e) => {
				debug!(?e, "Failed to look up move destination;");
				return false;
			}
		};

		let Some(existing) = existing else {
			return false;
		};

		match self.store.previous_revision(&existing.id).await {
			Ok(previous) => previous
				.and_then(|previous| previous.move_from)
				.is_some_and(|move_from| move_from.path == src),
			Err(e) => {
				debug!(?e, "Failed to look up previous revision;");
				false
			}
		}
	}
}

fn file_doc(event: &Event) -> LocalDocument {
	LocalDocument::file(&event.path, event.stats.as_ref(), event.md5sum.clone())
}

fn folder_doc(event: &Event) -> LocalDocument {
	LocalDocument::folder(&event.path, event.stats.as_ref())
}

impl TimedStep for Dispatcher {
	const NAME: &'static str = STEP_NAME;

	fn next_deadline(&self) -> Option<Instant> {
		self.local_end_at
	}

	async fn on_batch(&mut self, batch: Batch, _out: &Channel) {
		self.local_end_at = None;
		self.signals.emit(WatcherSignal::LocalStart);

		for event in &batch {
			if let Err(e) = self.dispatch_event(event).await {
				error!(?e, path = %event.path.display(), action = ?event.action, "Could not dispatch local event;");
			}
		}

		self.local_end_at = Some(Instant::now() + self.local_end_delay);
	}

	fn on_deadline(&mut self, _now: Instant, _out: &Channel) {
		self.local_end_at = None;
		self.signals.emit(WatcherSignal::LocalEnd);
	}

	fn flush(&mut self, _out: &Channel) {
		if self.local_end_at.take().is_some() {
			self.signals.emit(WatcherSignal::LocalEnd);
		}
	}
}
