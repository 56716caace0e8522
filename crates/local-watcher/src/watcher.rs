use crate::{
	channel::Channel,
	checksum::ContentHasher,
	config::WatcherConfig,
	dispatch::Dispatcher,
	error::{ConfigError, Error},
	ignore::IgnoreRules,
	platform::{self, PlatformWatchBackend},
	producer::Producer,
	provenance::AuditLog,
	signals::{Signals, WatcherSignal},
	steps::{
		add_checksum::AddChecksum, add_infos::AddInfos, await_write_finish::AwaitWriteFinish,
		detect_move::DetectMove, filter_ignored::FilterIgnored,
		identical_renaming::IdenticalRenaming, incomplete_fixer::IncompleteFixer,
		initial_diff::InitialDiff, overwrite::Overwrite, scan_folder::ScanFolder,
	},
	store::{DocumentStore, Merge},
};

use std::sync::Arc;

use async_channel as chan;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, instrument, warn};

/// What the watcher needs from the rest of the application.
#[derive(Clone)]
pub struct Collaborators {
	pub store: Arc<dyn DocumentStore>,
	pub merge: Arc<dyn Merge>,
	pub ignore: Arc<dyn IgnoreRules>,
	pub hasher: Arc<dyn ContentHasher>,
}

/// Watches a synchronized directory, feeding its local changes to the merge layer.
pub struct ChannelWatcher {
	config: Arc<WatcherConfig>,
	producer: Producer,
	signals: Signals,
	audit: Arc<AuditLog>,
	fatal_rx: chan::Receiver<Error>,
	dispatched: Channel,
	started: bool,
	paused: bool,
}

impl ChannelWatcher {
	/// Build the whole pipeline with the watch backend of the current platform.
	pub fn new(config: WatcherConfig, collaborators: Collaborators) -> Result<Self, Error> {
		Self::with_backend(config, collaborators, platform::current())
	}

	pub fn with_backend(
		config: WatcherConfig,
		collaborators: Collaborators,
		backend: Box<dyn PlatformWatchBackend>,
	) -> Result<Self, Error> {
		if !config.sync_path.is_absolute() {
			return Err(ConfigError::RelativeSyncPath(config.sync_path.into_boxed_path()).into());
		}
		config.validate()?;

		let Collaborators {
			store,
			merge,
			ignore,
			hasher,
		} = collaborators;

		let config = Arc::new(config);
		let signals = Signals::new();
		let audit = Arc::new(AuditLog::default());
		let (fatal_tx, fatal_rx) = chan::bounded(1);

		let reports_moves = backend.reports_moves();
		debug!(backend = backend.name(), reports_moves, "Building local watcher pipeline");

		let producer = Producer::new(
			Arc::clone(&config),
			Arc::clone(&ignore),
			backend,
			signals.clone(),
			fatal_tx,
		);

		let mut channel = AddInfos::new(Arc::clone(&config), Arc::clone(&store)).spawn(producer.channel());
		channel = FilterIgnored::new(ignore, Arc::clone(&audit)).spawn(channel);

		if !reports_moves {
			channel = IdenticalRenaming::new(&config, Arc::clone(&store), Arc::clone(&audit))
				.spawn(channel);
			channel = DetectMove::new(&config, Arc::clone(&store), Arc::clone(&audit)).spawn(channel);
		}

		channel = ScanFolder::new(producer.scanner()).spawn(channel);
		channel = AwaitWriteFinish::new(&config, Arc::clone(&audit)).spawn(channel);
		channel = InitialDiff::new(&config, Arc::clone(&store), Arc::clone(&audit)).spawn(channel);
		channel = AddChecksum::new(Arc::clone(&config), Arc::clone(&hasher)).spawn(channel);
		channel = IncompleteFixer::new(
			Arc::clone(&config),
			Arc::clone(&store),
			hasher,
			Arc::clone(&audit),
		)
		.spawn(channel);
		channel = Overwrite::new(&config, Arc::clone(&audit)).spawn(channel);

		let dispatched = Dispatcher::new(&config, store, merge, signals.clone()).spawn(channel);

		Ok(Self {
			config,
			producer,
			signals,
			audit,
			fatal_rx,
			dispatched,
			started: false,
			paused: false,
		})
	}

	/// Start watching, resolving once the initial scan went through the whole pipeline.
	#[instrument(skip(self), fields(sync_path = %self.config.sync_path.display()))]
	pub async fn start(&mut self) -> Result<(), Error> {
		if self.started {
			return Ok(());
		}

		info!("Starting local watcher...");

		// Subscribed first, the marker may go through quickly
		let mut signals = self.signals.subscribe();

		self.producer.start().await?;
		self.started = true;

		loop {
			match signals.recv().await {
				Ok(WatcherSignal::InitialScanDone) => break,
				Ok(_) => {}
				Err(RecvError::Lagged(skipped)) => {
					warn!(skipped, "Missed some watcher signals while waiting for the initial scan;");
				}
				Err(RecvError::Closed) => return Err(Error::PipelineClosed),
			}
		}

		info!("Local watcher started");

		Ok(())
	}

	/// Stop watching and wait for the events already notified to be dispatched.
	#[instrument(skip(self), fields(sync_path = %self.config.sync_path.display()))]
	pub async fn stop(&mut self) {
		info!("Stopping local watcher...");

		self.producer.stop().await;

		// Closed once the dispatcher is done with the last batch
		while self.dispatched.pop().await.is_some() {}

		info!("Local watcher stopped");
	}

	/// Stop watching, changes made until [`ChannelWatcher::resume`] won't be notified.
	pub fn pause(&mut self) {
		if self.paused {
			return;
		}

		self.producer.suspend();
		self.paused = true;
		self.signals.emit(WatcherSignal::Paused);
	}

	pub fn resume(&mut self) -> Result<(), Error> {
		if !self.paused {
			return Ok(());
		}

		self.producer.resume()?;
		self.paused = false;
		self.signals.emit(WatcherSignal::Resumed);

		Ok(())
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<WatcherSignal> {
		self.signals.subscribe()
	}

	/// Resolves with the error that broke the watcher, the caller deciding whether to restart.
	pub async fn wait_fatal(&self) -> Error {
		self.fatal_rx.recv().await.unwrap_or(Error::PipelineClosed)
	}

	/// How the events of the pipeline were transformed.
	#[must_use]
	pub fn audit(&self) -> Arc<AuditLog> {
		Arc::clone(&self.audit)
	}

	#[must_use]
	pub fn config(&self) -> &WatcherConfig {
		&self.config
	}
}
