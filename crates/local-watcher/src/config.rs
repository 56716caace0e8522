use crate::error::ConfigError;

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};

/// Busy files are retried with a doubled delay each time, this bounds the last one.
pub const MAX_CHECKSUM_RETRIES: u32 = 16;

/// Local watcher configuration, every delay in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
	/// Absolute path of the synchronized directory
	pub sync_path: PathBuf,

	/// Prefix of the entries we create ourselves while downloading, never reported
	pub temp_prefix: String,

	/// How often the platform backend gets a chance to flush its unpaired notifications
	pub tick_interval_ms: u64,

	/// How long a batch waits for further writes on the same files
	pub await_write_finish_ms: u64,

	/// How long a deletion waits for an identical renaming with a different case
	pub identical_renaming_ms: u64,

	/// How long a deletion or creation waits for its other half of a move
	pub detect_move_ms: u64,

	/// How long a deletion waits for a move or creation overwriting it
	pub overwrite_ms: u64,

	/// How long an incomplete event may wait for the event completing it
	pub incomplete_expiry_ms: u64,

	/// How long a batch from the initial scan waits for overlapping scans
	pub initial_diff_ms: u64,

	/// Delay after the last dispatched batch before reporting the end of local activity
	pub local_end_ms: u64,

	/// How long recent renames are kept to translate paths of deleted descendants
	pub recent_renames_ms: u64,

	/// How many times a checksum of a busy file is retried
	pub checksum_retries: u32,

	/// First checksum retry delay, doubled on every attempt
	pub checksum_retry_base_ms: u64,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			sync_path: PathBuf::new(),
			temp_prefix: ".system-tmp-".to_string(),
			tick_interval_ms: 100,
			await_write_finish_ms: 200,
			identical_renaming_ms: 500,
			detect_move_ms: 1000,
			overwrite_ms: 500,
			incomplete_expiry_ms: 3000,
			initial_diff_ms: 200,
			local_end_ms: 1000,
			recent_renames_ms: 30_000,
			checksum_retries: 5,
			checksum_retry_base_ms: 500,
		}
	}
}

impl WatcherConfig {
	#[must_use]
	pub fn new(sync_path: impl Into<PathBuf>) -> Self {
		Self {
			sync_path: sync_path.into(),
			..Default::default()
		}
	}

	/// Load the configuration from a JSON file, missing fields taking their default value
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.into(),
			source,
		})?;

		let config = serde_json::from_str::<Self>(&json).map_err(|source| ConfigError::Parse {
			path: path.into(),
			source,
		})?;

		config.validate()?;

		Ok(config)
	}

	/// Reject values the watcher can't run with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.tick_interval_ms == 0 {
			return Err(ConfigError::Invalid {
				field: "tick_interval_ms",
				reason: "must be greater than 0",
			});
		}

		if self.checksum_retries > MAX_CHECKSUM_RETRIES {
			return Err(ConfigError::Invalid {
				field: "checksum_retries",
				reason: "must be at most 16",
			});
		}

		Ok(())
	}

	#[must_use]
	pub const fn tick_interval(&self) -> Duration {
		// A zero period would make the producer's interval panic
		if self.tick_interval_ms == 0 {
			Duration::from_millis(1)
		} else {
			Duration::from_millis(self.tick_interval_ms)
		}
	}

	#[must_use]
	pub const fn await_write_finish_delay(&self) -> Duration {
		Duration::from_millis(self.await_write_finish_ms)
	}

	#[must_use]
	pub const fn identical_renaming_delay(&self) -> Duration {
		Duration::from_millis(self.identical_renaming_ms)
	}

	#[must_use]
	pub const fn detect_move_delay(&self) -> Duration {
		Duration::from_millis(self.detect_move_ms)
	}

	#[must_use]
	pub const fn overwrite_delay(&self) -> Duration {
		Duration::from_millis(self.overwrite_ms)
	}

	#[must_use]
	pub const fn incomplete_expiry(&self) -> Duration {
		Duration::from_millis(self.incomplete_expiry_ms)
	}

	#[must_use]
	pub const fn initial_diff_delay(&self) -> Duration {
		Duration::from_millis(self.initial_diff_ms)
	}

	#[must_use]
	pub const fn local_end_delay(&self) -> Duration {
		Duration::from_millis(self.local_end_ms)
	}

	#[must_use]
	pub const fn recent_renames_window(&self) -> Duration {
		Duration::from_millis(self.recent_renames_ms)
	}

	#[must_use]
	pub const fn checksum_retry_base(&self) -> Duration {
		Duration::from_millis(self.checksum_retry_base_ms)
	}

	/// Absolute path of an event path, which are relative to the synchronized directory
	#[must_use]
	pub fn absolute(&self, relative: impl AsRef<Path>) -> PathBuf {
		let relative = relative.as_ref();
		if relative.as_os_str().is_empty() {
			self.sync_path.clone()
		} else {
			self.sync_path.join(relative)
		}
	}

	/// Whether a path lies in our own temporary namespace
	#[must_use]
	pub fn is_temporary(&self, path: impl AsRef<Path>) -> bool {
		path.as_ref().components().any(|component| {
			component
				.as_os_str()
				.to_str()
				.is_some_and(|name| name.starts_with(&self.temp_prefix))
		})
	}
}
