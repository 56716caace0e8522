use crate::{
	channel::{Batch, Channel},
	config::WatcherConfig,
	error::{Error, FileIOError},
	event::{Action, Event, Kind},
	ignore::IgnoreRules,
	platform::{PlatformWatchBackend, RawChange},
	signals::{Signals, WatcherSignal},
	stats::stat,
};

use std::{
	collections::VecDeque,
	path::{Path, PathBuf},
	pin::pin,
	sync::Arc,
};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{
	fs, spawn,
	task::JoinHandle,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

const STEP_NAME: &str = "producer";

/// Walks directories of the synchronized tree, pushing a batch of `scan` events per directory.
///
/// Ignored entries are neither reported nor walked into.
#[derive(Clone)]
pub struct Scanner {
	config: Arc<WatcherConfig>,
	ignore: Arc<dyn IgnoreRules>,
	channel: Channel,
}

impl Scanner {
	#[must_use]
	pub fn new(config: Arc<WatcherConfig>, ignore: Arc<dyn IgnoreRules>, channel: Channel) -> Self {
		Self {
			config,
			ignore,
			channel,
		}
	}

	/// Scan a directory given relative to the synchronized one, parents before children.
	#[instrument(skip(self))]
	pub async fn scan(&self, relative: &Path) -> Result<(), Error> {
		let mut directories = VecDeque::from([relative.to_path_buf()]);

		while let Some(directory) = directories.pop_front() {
			let absolute = self.config.absolute(&directory);

			let mut read_dir = match fs::read_dir(&absolute).await {
				Ok(read_dir) => read_dir,
				Err(e) if directory == relative => {
					return Err(FileIOError::from((absolute, e, "scanning directory")).into());
				}
				Err(e) => {
					// Removed since we found it, its deletion will be notified
					debug!(?e, path = %absolute.display(), "Skipping directory we can't read;");
					continue;
				}
			};

			let mut batch = Batch::new();

			loop {
				let entry = match read_dir.next_entry().await {
					Ok(Some(entry)) => entry,
					Ok(None) => break,
					Err(e) => {
						warn!(?e, path = %absolute.display(), "Failed to read directory entry;");
						break;
					}
				};

				let path = directory.join(entry.file_name());
				if self.config.is_temporary(&path) {
					continue;
				}

				match stat(entry.path()).await {
					Ok(stats) => {
						let is_folder = stats.kind == Kind::Directory;
						if self.ignore.is_ignored(&path, is_folder) {
							trace!(path = %path.display(), "Ignored entry not scanned");
							continue;
						}
						if is_folder {
							directories.push_back(path.clone());
						}
						batch.push(Event::new(Action::Scan, stats.kind, path).with_stats(stats));
					}
					Err(e) => {
						if self.ignore.is_ignored(&path, false) {
							continue;
						}
						batch.push(
							Event::new(Action::Scan, Kind::Unknown, path).mark_incomplete(STEP_NAME, e),
						);
					}
				}
			}

			batch.sort_by(|a, b| a.path.cmp(&b.path));
			self.channel.push(batch);
		}

		Ok(())
	}
}

/// Bridge between the OS watch backend and the head of the pipeline.
///
/// On start, it subscribes to the backend, scans the whole synchronized directory, pushes the
/// `initial-scan-done` marker, and only then turns notifications into events.
pub struct Producer {
	config: Arc<WatcherConfig>,
	channel: Channel,
	scanner: Scanner,
	signals: Signals,
	backend: Option<Box<dyn PlatformWatchBackend>>,
	watcher: Option<RecommendedWatcher>,
	events_tx: chan::Sender<notify::Result<notify::Event>>,
	events_rx: chan::Receiver<notify::Result<notify::Event>>,
	stop_tx: chan::Sender<()>,
	stop_rx: chan::Receiver<()>,
	fatal_tx: chan::Sender<Error>,
	handle: Option<JoinHandle<()>>,
}

impl Producer {
	#[must_use]
	pub fn new(
		config: Arc<WatcherConfig>,
		ignore: Arc<dyn IgnoreRules>,
		backend: Box<dyn PlatformWatchBackend>,
		signals: Signals,
		fatal_tx: chan::Sender<Error>,
	) -> Self {
		let channel = Channel::new();
		let (events_tx, events_rx) = chan::unbounded();
		let (stop_tx, stop_rx) = chan::bounded(1);

		Self {
			scanner: Scanner::new(Arc::clone(&config), ignore, channel.clone()),
			config,
			channel,
			signals,
			backend: Some(backend),
			watcher: None,
			events_tx,
			events_rx,
			stop_tx,
			stop_rx,
			fatal_tx,
			handle: None,
		}
	}

	/// Head of the pipeline.
	#[must_use]
	pub fn channel(&self) -> Channel {
		self.channel.clone()
	}

	#[must_use]
	pub fn scanner(&self) -> Scanner {
		self.scanner.clone()
	}

	#[instrument(skip(self), fields(sync_path = %self.config.sync_path.display()))]
	pub async fn start(&mut self) -> Result<(), Error> {
		info!("Starting producer...");

		let Some(backend) = self.backend.take() else {
			return Err(Error::PipelineClosed);
		};
		debug!(backend = backend.name(), "Using watch backend");

		self.subscribe()?;

		self.signals.emit(WatcherSignal::BufferingStart);

		self.scanner.scan(Path::new("")).await?;

		self.channel.push(vec![Event::initial_scan_done()]);
		info!("Folder scan done");

		self.signals.emit(WatcherSignal::BufferingEnd);

		self.handle = Some(spawn(
			handle_watch_events(
				Arc::clone(&self.config),
				backend,
				self.scanner.clone(),
				self.channel.clone(),
				self.events_rx.clone(),
				self.stop_rx.clone(),
				self.fatal_tx.clone(),
			)
			.in_current_span(),
		));

		Ok(())
	}

	pub fn suspend(&mut self) {
		info!("Suspending producer...");
		self.unsubscribe();
	}

	pub fn resume(&mut self) -> Result<(), Error> {
		info!("Resuming producer...");
		self.subscribe()
	}

	/// Stop watching and close the head of the pipeline, letting every step drain.
	pub async fn stop(&mut self) {
		info!("Stopping producer...");

		self.unsubscribe();

		if let Some(handle) = self.handle.take() {
			if self.stop_tx.send(()).await.is_err() {
				trace!("Producer event loop was already gone");
			}
			if let Err(e) = handle.await {
				error!(?e, "Producer event loop panicked;");
			}
		}

		self.channel.close();
	}

	fn subscribe(&mut self) -> Result<(), Error> {
		if self.watcher.is_some() {
			return Ok(());
		}

		let events_tx = self.events_tx.clone();
		let mut watcher = RecommendedWatcher::new(
			move |result| {
				if !events_tx.is_closed() {
					// SAFETY: we are not blocking the thread as this is an unbounded channel
					if events_tx.send_blocking(result).is_err() {
						error!("Unable to send watcher event to the producer;");
					}
				} else {
					error!("Tried to send file system events to a closed channel;");
				}
			},
			Config::default(),
		)?;

		watcher
			.watch(&self.config.sync_path, RecursiveMode::Recursive)
			.map_err(|e| match e.kind {
				notify::ErrorKind::MaxFilesWatch => Error::WatchLimit,
				_ => Error::Watch(e),
			})?;

		self.watcher = Some(watcher);

		Ok(())
	}

	fn unsubscribe(&mut self) {
		if let Some(mut watcher) = self.watcher.take() {
			if let Err(e) = watcher.unwatch(&self.config.sync_path) {
				warn!(?e, "Failed to unwatch synchronized directory;");
			}
		}
	}
}

async fn handle_watch_events(
	config: Arc<WatcherConfig>,
	mut backend: Box<dyn PlatformWatchBackend>,
	scanner: Scanner,
	channel: Channel,
	events_rx: chan::Receiver<notify::Result<notify::Event>>,
	stop_rx: chan::Receiver<()>,
	fatal_tx: chan::Sender<Error>,
) {
	enum StreamMessage {
		NewEvent(notify::Result<notify::Event>),
		Tick,
		Stop,
	}

	let mut tick_interval =
		interval_at(Instant::now() + config.tick_interval(), config.tick_interval());
	tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let mut msg_stream = pin!((
		events_rx.map(StreamMessage::NewEvent),
		IntervalStream::new(tick_interval).map(|_| StreamMessage::Tick),
		stop_rx.map(|()| StreamMessage::Stop),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		let changes = match msg {
			StreamMessage::NewEvent(Ok(event)) => backend.handle_event(event),

			StreamMessage::NewEvent(Err(e)) => {
				if matches!(e.kind, notify::ErrorKind::MaxFilesWatch) {
					report_fatal(&fatal_tx, Error::WatchLimit).await;
					break;
				}
				error!(?e, "Watcher error;");
				continue;
			}

			StreamMessage::Tick => backend.tick(),

			StreamMessage::Stop => {
				debug!("Stopping producer event loop");
				break;
			}
		};

		match build_batch(&config, changes) {
			Ok((batch, rescan)) => {
				channel.push(batch);
				if rescan {
					info!("Watch backend asked for a rescan");
					if let Err(e) = scanner.scan(Path::new("")).await {
						error!(?e, "Failed to rescan synchronized directory;");
					}
				}
			}
			Err(e) => {
				report_fatal(&fatal_tx, e).await;
				break;
			}
		}
	}
}

async fn report_fatal(fatal_tx: &chan::Sender<Error>, e: Error) {
	error!(?e, "Fatal local watcher error;");
	if fatal_tx.send(e).await.is_err() {
		error!("Nobody is listening to fatal local watcher errors;");
	}
}

/// Turn backend changes into a batch of events, with paths relative to the synchronized one.
///
/// Returns whether a rescan was requested, and fails when the synchronized directory itself
/// was removed.
fn build_batch(config: &WatcherConfig, changes: Vec<RawChange>) -> Result<(Batch, bool), Error> {
	let mut batch = Batch::with_capacity(changes.len());
	let mut rescan = false;

	for change in changes {
		if let RawChange::Removed { path, .. } = &change {
			if path == &config.sync_path {
				return Err(Error::RootRemoved(path.clone()));
			}
		}

		if let Some(event) = build_event(config, change, &mut rescan) {
			batch.push(event);
		}
	}

	Ok((batch, rescan))
}

fn build_event(config: &WatcherConfig, change: RawChange, rescan: &mut bool) -> Option<Event> {
	let relative = |path: &Path| -> Option<PathBuf> {
		let relative = path.strip_prefix(&config.sync_path).ok()?;
		(!relative.as_os_str().is_empty() && !config.is_temporary(relative))
			.then(|| relative.to_path_buf())
	};

	match change {
		RawChange::Created { path, kind } => {
			relative(&path).map(|path| Event::new(Action::Created, kind, path))
		}
		RawChange::Modified { path, kind } => {
			relative(&path).map(|path| Event::new(Action::Modified, kind, path))
		}
		RawChange::Removed { path, kind } => {
			relative(&path).map(|path| Event::new(Action::Deleted, kind, path))
		}
		RawChange::Renamed { from, to, kind } => match (relative(&from), relative(&to)) {
			(Some(old_path), Some(path)) => Some(Event::renamed(kind, old_path, path)),
			// Moved in from outside, or out of our own temporary namespace
			(None, Some(path)) => Some(Event::new(Action::Created, kind, path)),
			(Some(old_path), None) => Some(Event::new(Action::Deleted, kind, old_path)),
			(None, None) => None,
		},
		RawChange::Rescan => {
			*rescan = true;
			None
		}
	}
}
