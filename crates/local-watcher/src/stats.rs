use crate::{
	error::FileIOError,
	event::{Identity, Kind},
};

use std::{fs::Metadata, path::Path, time::SystemTime};

use tokio::fs;

/// Snapshot of an entry's metadata taken when an event was enriched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
	pub kind: Kind,
	pub size: u64,
	pub mtime: SystemTime,
	pub ctime: Option<SystemTime>,
	pub identity: Option<Identity>,
}

impl Stats {
	/// Most recent of the change and modification times.
	#[must_use]
	pub fn update_time(&self) -> SystemTime {
		self.ctime.map_or(self.mtime, |ctime| ctime.max(self.mtime))
	}
}

/// Stat an entry without following symlinks, so they can be told apart and skipped.
pub async fn stat(path: impl AsRef<Path> + Send) -> Result<Stats, FileIOError> {
	let path = path.as_ref();

	let metadata = fs::symlink_metadata(path)
		.await
		.map_err(|e| FileIOError::from((path, e)))?;

	let identity = identity(path, &metadata).await?;

	Ok(Stats {
		kind: kind(&metadata),
		size: metadata.len(),
		mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
		ctime: change_time(&metadata),
		identity,
	})
}

/// Same as [`stat`] but a vanished entry is not an error.
pub async fn stat_maybe(path: impl AsRef<Path> + Send) -> Result<Option<Stats>, FileIOError> {
	match stat(path).await {
		Ok(stats) => Ok(Some(stats)),
		Err(e) if e.is_not_found() => Ok(None),
		Err(e) => Err(e),
	}
}

fn kind(metadata: &Metadata) -> Kind {
	let file_type = metadata.file_type();

	if file_type.is_symlink() {
		Kind::Symlink
	} else if file_type.is_dir() {
		Kind::Directory
	} else if file_type.is_file() {
		Kind::File
	} else {
		Kind::Unknown
	}
}

#[cfg(unix)]
fn change_time(metadata: &Metadata) -> Option<SystemTime> {
	use std::{os::unix::fs::MetadataExt, time::Duration};

	let secs = u64::try_from(metadata.ctime()).ok()?;
	let nanos = u32::try_from(metadata.ctime_nsec()).ok()?;

	SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn change_time(metadata: &Metadata) -> Option<SystemTime> {
	metadata.created().ok()
}

#[cfg(unix)]
#[allow(clippy::unused_async)]
async fn identity(_path: &Path, metadata: &Metadata) -> Result<Option<Identity>, FileIOError> {
	use std::os::unix::fs::MetadataExt;

	Ok(Some(Identity::Inode(metadata.ino())))
}

#[cfg(windows)]
async fn identity(path: &Path, _metadata: &Metadata) -> Result<Option<Identity>, FileIOError> {
	// `MetadataExt::file_index` is still unstable, so we ask the file handle directly
	use std::io;

	use winapi_util::{file::information, Handle};

	let owned_path = path.to_path_buf();
	let index = tokio::task::spawn_blocking(move || {
		Handle::from_path_any(&owned_path).and_then(|ref handle| information(handle))
	})
	.await
	.map_err(|e| FileIOError::from((path, io::Error::other(e), "joining file id lookup")))?
	.map_err(|e| FileIOError::from((path, e)))?
	.file_index();

	Ok(Some(Identity::FileId(format!("{index:#018X}"))))
}

#[cfg(not(any(unix, windows)))]
#[allow(clippy::unused_async)]
async fn identity(_path: &Path, _metadata: &Metadata) -> Result<Option<Identity>, FileIOError> {
	Ok(None)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn stat_reports_kind_and_identity() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("file.txt");
		fs::write(&file, b"hello").await.unwrap();

		let stats = stat(&file).await.unwrap();
		assert_eq!(stats.kind, Kind::File);
		assert_eq!(stats.size, 5);
		assert!(stats.identity.is_some());

		let stats = stat(dir.path()).await.unwrap();
		assert_eq!(stats.kind, Kind::Directory);
	}

	#[tokio::test]
	async fn stat_maybe_of_missing_entry_is_none() {
		let dir = tempfile::tempdir().unwrap();

		assert!(stat_maybe(dir.path().join("missing")).await.unwrap().is_none());
		assert!(stat(dir.path().join("missing")).await.unwrap_err().is_not_found());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn symlinks_are_not_followed() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("target");
		fs::write(&target, b"").await.unwrap();
		let link = dir.path().join("link");
		fs::symlink(&target, &link).await.unwrap();

		assert_eq!(stat(&link).await.unwrap().kind, Kind::Symlink);
	}
}
