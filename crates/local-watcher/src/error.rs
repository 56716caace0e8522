use std::{
	fmt::{self, Display},
	io,
	path::{Path, PathBuf},
};

use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("watch backend error: {0}")]
	Watch(#[from] notify::Error),
	#[error("the synchronized directory was removed: <path='{}'>", .0.display())]
	RootRemoved(PathBuf),
	#[error("reached the maximum number of watched directories allowed by the system")]
	WatchLimit,
	#[error("document store error: {0}")]
	Store(#[source] BoxedError),
	#[error("merge error: {0}")]
	Merge(#[source] BoxedError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("local watcher pipeline is closed")]
	PipelineClosed,
}

impl Error {
	pub fn store(e: impl Into<BoxedError>) -> Self {
		Self::Store(e.into())
	}

	pub fn merge(e: impl Into<BoxedError>) -> Self {
		Self::Merge(e.into())
	}

	/// Errors that must stop the whole watcher instead of being logged by the step that hit them.
	#[must_use]
	pub const fn is_fatal(&self) -> bool {
		matches!(
			self,
			Self::Watch(_) | Self::RootRemoved(_) | Self::WatchLimit | Self::PipelineClosed
		)
	}
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read watcher config: <path='{}'>: {source}", .path.display())]
	Read {
		path: Box<Path>,
		#[source]
		source: io::Error,
	},
	#[error("failed to parse watcher config: <path='{}'>: {source}", .path.display())]
	Parse {
		path: Box<Path>,
		#[source]
		source: serde_json::Error,
	},
	#[error("invalid watcher config value for `{field}`: {reason}")]
	Invalid {
		field: &'static str,
		reason: &'static str,
	},
	#[error("the synchronized directory path must be absolute: <path='{}'>", .0.display())]
	RelativeSyncPath(Box<Path>),
}

/// File I/O error that includes the path that caused the error
#[derive(Debug, Error)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: io::Error,
	pub maybe_context: Option<&'static str>,
}

impl Display for FileIOError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl FileIOError {
	#[must_use]
	pub fn kind(&self) -> io::ErrorKind {
		self.source.kind()
	}

	/// The entry vanished between the notification and our access to it.
	#[must_use]
	pub fn is_not_found(&self) -> bool {
		self.source.kind() == io::ErrorKind::NotFound
	}

	/// The file is locked by another process (EBUSY, or a sharing violation on Windows).
	#[must_use]
	pub fn is_busy(&self) -> bool {
		const EBUSY: i32 = 16;
		const ERROR_SHARING_VIOLATION: i32 = 32;

		match self.source.raw_os_error() {
			Some(code) if cfg!(windows) => code == ERROR_SHARING_VIOLATION,
			Some(code) => code == EBUSY,
			None => false,
		}
	}
}

impl<P: AsRef<Path>> From<(P, io::Error)> for FileIOError {
	fn from((path, source): (P, io::Error)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: None,
		}
	}
}

impl<P: AsRef<Path>> From<(P, io::Error, &'static str)> for FileIOError {
	fn from((path, source, context): (P, io::Error, &'static str)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(context),
		}
	}
}
