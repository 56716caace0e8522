use crate::{config::WatcherConfig, error::FileIOError};

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use md5::{Digest, Md5};
use tokio::{
	fs::File,
	io::AsyncReadExt,
	sync::Mutex,
	time::sleep,
};
use tracing::{debug, trace};

const BLOCK_LEN: usize = 1_048_576;

/// Content digest provider
#[async_trait]
pub trait ContentHasher: Send + Sync + 'static {
	async fn hash(&self, path: &Path) -> Result<String, FileIOError>;
}

/// MD5 digests encoded in base64, the format of the synchronized documents' checksums.
///
/// Files are hashed one at a time: linear reads are faster on spinning disks than many
/// concurrent ones.
#[derive(Debug)]
pub struct Md5Checksumer {
	queue: Mutex<()>,
	retries: u32,
	retry_base: Duration,
}

impl Default for Md5Checksumer {
	fn default() -> Self {
		Self::new(&WatcherConfig::default())
	}
}

impl Md5Checksumer {
	#[must_use]
	pub fn new(config: &WatcherConfig) -> Self {
		Self {
			queue: Mutex::new(()),
			retries: config.checksum_retries,
			retry_base: config.checksum_retry_base(),
		}
	}

	/// Base delay doubled on every attempt, saturating instead of overflowing.
	fn retry_delay(&self, attempt: u32) -> Duration {
		self.retry_base
			.saturating_mul(2_u32.checked_pow(attempt).unwrap_or(u32::MAX))
	}

	async fn checksum(path: &Path) -> Result<String, FileIOError> {
		let mut reader = File::open(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "opening file to compute checksum")))?;

		let mut context = Md5::new();
		let mut buffer = vec![0; BLOCK_LEN].into_boxed_slice();
		loop {
			let read_count = reader
				.read(&mut buffer)
				.await
				.map_err(|e| FileIOError::from((path, e, "reading file to compute checksum")))?;
			if read_count == 0 {
				break;
			}
			context.update(&buffer[..read_count]);
		}

		Ok(STANDARD.encode(context.finalize()))
	}
}

#[async_trait]
impl ContentHasher for Md5Checksumer {
	async fn hash(&self, path: &Path) -> Result<String, FileIOError> {
		let _queued = self.queue.lock().await;

		let mut attempt = 0;
		loop {
			match Self::checksum(path).await {
				Ok(md5sum) => {
					trace!(path = %path.display(), %md5sum, "Computed checksum");
					return Ok(md5sum);
				}
				Err(e) if e.is_busy() && attempt < self.retries => {
					let delay = self.retry_delay(attempt);
					debug!(?e, ?delay, attempt, "File is busy, retrying checksum;");
					attempt += 1;
					sleep(delay).await;
				}
				Err(e) => return Err(e),
			}
		}
	}
}
