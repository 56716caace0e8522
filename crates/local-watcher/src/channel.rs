use crate::event::Event;

use std::future::Future;

use async_channel as chan;
use tokio::spawn;
use tracing::{trace, Instrument};

/// Events produced together, by one notification tick or one flush of a step.
pub type Batch = Vec<Event>;

/// Ordered and unbounded queue of batches connecting two steps of the pipeline.
///
/// A notification volume is bounded by actual user activity, so there is no backpressure here.
/// Closing a channel lets its consumer drain the remaining batches before [`Channel::pop`]
/// returns `None`, which is how the pipeline shuts down step after step.
#[derive(Debug, Clone)]
pub struct Channel {
	tx: chan::Sender<Batch>,
	rx: chan::Receiver<Batch>,
}

impl Default for Channel {
	fn default() -> Self {
		Self::new()
	}
}

impl Channel {
	#[must_use]
	pub fn new() -> Self {
		let (tx, rx) = chan::unbounded();
		Self { tx, rx }
	}

	/// Pushing an empty batch is a no-op.
	pub fn push(&self, batch: Batch) {
		if batch.is_empty() {
			return;
		}

		// SAFETY: this channel is unbounded so it can't be full, only closed
		if self.tx.try_send(batch).is_err() {
			trace!("Dropped a batch pushed to a closed channel;");
		}
	}

	/// Oldest buffered batch, waiting for the next push if there is none.
	///
	/// Returns `None` once the channel is closed and drained.
	pub async fn pop(&self) -> Option<Batch> {
		self.rx.recv().await.ok()
	}

	pub fn close(&self) {
		self.tx.close();
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.rx.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.rx.is_empty()
	}

	/// Spawn a task pushing `f(batch)` to a new channel for each batch popped from this one.
	#[must_use]
	pub fn map<F>(self, mut f: F) -> Self
	where
		F: FnMut(Batch) -> Batch + Send + 'static,
	{
		let out = Self::new();

		spawn({
			let out = out.clone();
			async move {
				while let Some(batch) = self.pop().await {
					out.push(f(batch));
				}

				out.close();
			}
			.in_current_span()
		});

		out
	}

	/// Same as [`Channel::map`], for transformations that have to wait on I/O.
	#[must_use]
	pub fn async_map<F, Fut>(self, mut f: F) -> Self
	where
		F: FnMut(Batch) -> Fut + Send + 'static,
		Fut: Future<Output = Batch> + Send,
	{
		let out = Self::new();

		spawn({
			let out = out.clone();
			async move {
				while let Some(batch) = self.pop().await {
					out.push(f(batch).await);
				}

				out.close();
			}
			.in_current_span()
		});

		out
	}
}
