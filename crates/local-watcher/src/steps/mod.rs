//! Steps of the pipeline, in the order they are chained.
//!
//! Stateless steps are built on [`Channel::map`] and [`Channel::async_map`]. Steps holding
//! events back for a while own their state in a struct implementing [`TimedStep`], driven by
//! [`spawn_timed`]: a single task that handles either the next batch or the next expired
//! deadline, and flushes whatever it still holds once its input is closed.

use crate::channel::{Batch, Channel};

use std::future::{pending, Future};

use tokio::{
	spawn,
	time::{sleep_until, Instant},
};
use tracing::{debug, Instrument};

pub mod add_checksum;
pub mod add_infos;
pub mod await_write_finish;
pub mod detect_move;
pub mod filter_ignored;
pub mod identical_renaming;
pub mod incomplete_fixer;
pub mod initial_diff;
pub mod overwrite;
pub mod scan_folder;

pub trait TimedStep: Send + 'static {
	const NAME: &'static str;

	/// When the oldest held item must be released, if any.
	fn next_deadline(&self) -> Option<Instant>;

	fn on_batch(&mut self, batch: Batch, out: &Channel) -> impl Future<Output = ()> + Send;

	fn on_deadline(&mut self, now: Instant, out: &Channel);

	/// Release everything still held, the input being closed.
	fn flush(&mut self, out: &Channel);
}

#[must_use]
pub fn spawn_timed<S: TimedStep>(mut step: S, input: Channel) -> Channel {
	let out = Channel::new();

	spawn({
		let out = out.clone();
		async move {
			loop {
				tokio::select! {
					biased;

					() = sleep_until_maybe(step.next_deadline()) => {
						step.on_deadline(Instant::now(), &out);
					}

					maybe_batch = input.pop() => match maybe_batch {
						Some(batch) => step.on_batch(batch, &out).await,
						None => break,
					},
				}
			}

			step.flush(&out);
			out.close();

			debug!(step = S::NAME, "Input closed, step stopped");
		}
		.in_current_span()
	});

	out
}

async fn sleep_until_maybe(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => sleep_until(deadline).await,
		None => pending().await,
	}
}
