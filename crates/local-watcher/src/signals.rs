use tokio::sync::broadcast;
use tracing::trace;

const SIGNALS_CAPACITY: usize = 256;

/// Status notifications observable by the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherSignal {
	BufferingStart,
	BufferingEnd,
	LocalStart,
	LocalEnd,
	InitialScanDone,
	/// Changes sequence of the document store after a merge
	SyncTarget(u64),
	Paused,
	Resumed,
}

/// Cloneable sender side of the status notifications.
#[derive(Debug, Clone)]
pub struct Signals {
	tx: broadcast::Sender<WatcherSignal>,
}

impl Default for Signals {
	fn default() -> Self {
		Self::new()
	}
}

impl Signals {
	#[must_use]
	pub fn new() -> Self {
		let (tx, _) = broadcast::channel(SIGNALS_CAPACITY);
		Self { tx }
	}

	pub fn emit(&self, signal: WatcherSignal) {
		trace!(?signal, "Emitting watcher signal");
		// Nobody listening is fine
		let _ = self.tx.send(signal);
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<WatcherSignal> {
		self.tx.subscribe()
	}
}
