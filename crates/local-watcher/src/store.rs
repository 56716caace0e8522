//! Interfaces of the document store and merge layer the pipeline feeds.
//!
//! Both are implemented outside of this crate: the store persists the synchronized document
//! tree and the merge layer reconciles local changes with it.

use crate::{
	error::Error,
	event::{Identity, Kind},
	stats::Stats,
};

use std::{
	any::Any,
	fmt,
	path::{Path, PathBuf},
	time::SystemTime,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Normalized document id of a relative path.
///
/// Case insensitive file systems are handled by upper casing the path, so two paths differing
/// only by their case share the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
	#[must_use]
	pub fn from_path(path: impl AsRef<Path>) -> Self {
		let path = path.as_ref().to_string_lossy();

		if cfg!(windows) {
			Self(path.to_uppercase())
		} else {
			Self(path.into_owned())
		}
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DocId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
	File,
	Folder,
}

impl From<DocKind> for Kind {
	fn from(kind: DocKind) -> Self {
		match kind {
			DocKind::File => Self::File,
			DocKind::Folder => Self::Directory,
		}
	}
}

/// A move the synchronization is applying to a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveFrom {
	pub path: PathBuf,
}

/// Last known state of a synchronized file or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
	pub id: DocId,
	pub path: PathBuf,
	pub kind: DocKind,
	pub ino: Option<u64>,
	pub fileid: Option<String>,
	pub md5sum: Option<String>,
	pub updated_at: SystemTime,
	pub trashed: bool,
	pub move_from: Option<MoveFrom>,
}

impl Document {
	#[must_use]
	pub fn new(path: impl Into<PathBuf>, kind: DocKind) -> Self {
		let path = path.into();
		Self {
			id: DocId::from_path(&path),
			path,
			kind,
			ino: None,
			fileid: None,
			md5sum: None,
			updated_at: SystemTime::UNIX_EPOCH,
			trashed: false,
			move_from: None,
		}
	}

	#[must_use]
	pub fn with_identity(mut self, identity: Identity) -> Self {
		match identity {
			Identity::Inode(ino) => self.ino = Some(ino),
			Identity::FileId(fileid) => self.fileid = Some(fileid),
		}
		self
	}

	/// File id when known, inode otherwise.
	#[must_use]
	pub fn identity(&self) -> Option<Identity> {
		self.fileid
			.clone()
			.map(Identity::FileId)
			.or(self.ino.map(Identity::Inode))
	}

	#[must_use]
	pub fn event_kind(&self) -> Kind {
		self.kind.into()
	}
}

/// Origin of a change handed to the merge layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
	Local,
	Remote,
}

/// Document built from a local event, to be merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
	pub path: PathBuf,
	pub kind: DocKind,
	pub identity: Option<Identity>,
	pub size: Option<u64>,
	pub updated_at: Option<SystemTime>,
	pub md5sum: Option<String>,
	/// Existing document at the destination of an overwriting move
	pub overwrite: Option<Document>,
}

impl LocalDocument {
	#[must_use]
	pub fn file(path: impl Into<PathBuf>, stats: Option<&Stats>, md5sum: Option<String>) -> Self {
		Self::build(path, DocKind::File, stats, md5sum)
	}

	#[must_use]
	pub fn folder(path: impl Into<PathBuf>, stats: Option<&Stats>) -> Self {
		Self::build(path, DocKind::Folder, stats, None)
	}

	fn build(
		path: impl Into<PathBuf>,
		kind: DocKind,
		stats: Option<&Stats>,
		md5sum: Option<String>,
	) -> Self {
		Self {
			path: path.into(),
			kind,
			identity: stats.and_then(|stats| stats.identity.clone()),
			size: stats.filter(|_| kind == DocKind::File).map(|stats| stats.size),
			updated_at: stats.map(Stats::update_time),
			md5sum,
			overwrite: None,
		}
	}
}

/// Lock on the document store, released when dropped.
pub struct StoreLock {
	scope: &'static str,
	_guard: Box<dyn Any + Send>,
}

impl StoreLock {
	/// Wrap whatever guard the store uses to release its lock on drop.
	pub fn new(scope: &'static str, guard: impl Any + Send) -> Self {
		trace!(%scope, "Acquired document store lock");
		Self {
			scope,
			_guard: Box::new(guard),
		}
	}
}

impl fmt::Debug for StoreLock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StoreLock")
			.field("scope", &self.scope)
			.finish_non_exhaustive()
	}
}

impl Drop for StoreLock {
	fn drop(&mut self) {
		trace!(scope = %self.scope, "Released document store lock");
	}
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
	async fn by_local_path(&self, path: &Path) -> Result<Option<Document>, Error>;

	async fn by_id(&self, id: &DocId) -> Result<Option<Document>, Error>;

	/// Serialize with the other users of the store; held until the returned guard is dropped.
	async fn lock(&self, scope: &'static str) -> Result<StoreLock, Error>;

	async fn changes_sequence(&self) -> Result<u64, Error>;

	/// Every known document, used to find what changed while the watcher was stopped.
	async fn tree(&self) -> Result<Vec<Document>, Error>;

	/// Previous revision of a document, if any.
	async fn previous_revision(&self, id: &DocId) -> Result<Option<Document>, Error>;
}

#[async_trait]
pub trait Merge: Send + Sync + 'static {
	async fn add_file(&self, side: Side, doc: LocalDocument) -> Result<(), Error>;

	async fn update_file(&self, side: Side, doc: LocalDocument) -> Result<(), Error>;

	async fn put_folder(&self, side: Side, doc: LocalDocument) -> Result<(), Error>;

	async fn move_file(&self, side: Side, doc: LocalDocument, was: Document) -> Result<(), Error>;

	async fn move_folder(&self, side: Side, doc: LocalDocument, was: Document)
		-> Result<(), Error>;

	async fn trash_file(&self, side: Side, was: Document) -> Result<(), Error>;

	async fn trash_folder(&self, side: Side, was: Document) -> Result<(), Error>;
}
