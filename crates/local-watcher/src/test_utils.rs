use crate::{
	channel::Channel,
	error::Error,
	event::{Action, Event, Identity, Kind},
	stats::Stats,
	store::{DocId, DocKind, Document, DocumentStore, LocalDocument, Merge, Side, StoreLock},
};

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, SystemTime},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::timeout;

pub fn stats(kind: Kind, ino: u64) -> Stats {
	Stats {
		kind,
		size: 42,
		mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000),
		ctime: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)),
		identity: Some(Identity::Inode(ino)),
	}
}

/// An event about an existing entry, with its stats.
pub fn event(action: Action, kind: Kind, path: &str, ino: u64) -> Event {
	Event::new(action, kind, path).with_stats(stats(kind, ino))
}

pub fn file(action: Action, path: &str, ino: u64) -> Event {
	event(action, Kind::File, path, ino)
}

pub fn deleted(kind: Kind, path: &str, ino: Option<u64>) -> Event {
	Event::new(Action::Deleted, kind, path).with_deleted_ino(ino.map(Identity::Inode))
}

pub fn renamed(kind: Kind, old_path: &str, path: &str, ino: u64) -> Event {
	event(Action::Renamed, kind, path, ino).with_old_path(old_path)
}

pub fn doc(path: &str, kind: DocKind, ino: u64) -> Document {
	Document::new(path, kind).with_identity(Identity::Inode(ino))
}

/// Summary of an event, easier to compare than the event itself.
pub fn summary(event: &Event) -> (Action, PathBuf, Option<PathBuf>) {
	(event.action, event.path.clone(), event.old_path.clone())
}

pub fn summaries(batch: &[Event]) -> Vec<(Action, PathBuf, Option<PathBuf>)> {
	batch.iter().map(summary).collect()
}

pub fn expected(action: Action, path: &str, old_path: Option<&str>) -> (Action, PathBuf, Option<PathBuf>) {
	(action, PathBuf::from(path), old_path.map(PathBuf::from))
}

/// Next batch, failing the test if none comes in a (virtual) minute.
pub async fn next_batch(channel: &Channel) -> Vec<Event> {
	timeout(Duration::from_secs(60), channel.pop())
		.await
		.expect("timed out waiting for a batch")
		.expect("channel closed")
}

/// Whether a batch is available without waiting longer than `delay`.
pub async fn nothing_within(channel: &Channel, delay: Duration) -> bool {
	timeout(delay, channel.pop()).await.is_err()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
	docs: Mutex<HashMap<DocId, Document>>,
	previous: Mutex<HashMap<DocId, Document>>,
	lock: Arc<tokio::sync::Mutex<()>>,
	seq: AtomicU64,
}

impl MemoryStore {
	pub fn with_docs(docs: impl IntoIterator<Item = Document>) -> Arc<Self> {
		let store = Self::default();
		for doc in docs {
			store.put(doc);
		}
		Arc::new(store)
	}

	pub fn put(&self, doc: Document) {
		self.seq.fetch_add(1, Ordering::Relaxed);
		self.docs.lock().insert(doc.id.clone(), doc);
	}

	pub fn put_previous(&self, doc: Document) {
		self.previous.lock().insert(doc.id.clone(), doc);
	}

	pub fn is_locked(&self) -> bool {
		self.lock.try_lock().is_err()
	}
}

#[async_trait]
impl DocumentStore for MemoryStore {
	async fn by_local_path(&self, path: &Path) -> Result<Option<Document>, Error> {
		Ok(self.docs.lock().get(&DocId::from_path(path)).cloned())
	}

	async fn by_id(&self, id: &DocId) -> Result<Option<Document>, Error> {
		Ok(self.docs.lock().get(id).cloned())
	}

	async fn lock(&self, scope: &'static str) -> Result<StoreLock, Error> {
		let guard = Arc::clone(&self.lock).lock_owned().await;
		Ok(StoreLock::new(scope, guard))
	}

	async fn changes_sequence(&self) -> Result<u64, Error> {
		Ok(self.seq.load(Ordering::Relaxed))
	}

	async fn tree(&self) -> Result<Vec<Document>, Error> {
		let mut docs = self.docs.lock().values().cloned().collect::<Vec<_>>();
		docs.sort_by(|a, b| a.path.cmp(&b.path));
		Ok(docs)
	}

	async fn previous_revision(&self, id: &DocId) -> Result<Option<Document>, Error> {
		Ok(self.previous.lock().get(id).cloned())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeCall {
	AddFile(PathBuf),
	UpdateFile(PathBuf),
	PutFolder(PathBuf),
	MoveFile { from: PathBuf, to: PathBuf, overwrite: bool },
	MoveFolder { from: PathBuf, to: PathBuf, overwrite: bool },
	TrashFile(PathBuf),
	TrashFolder(PathBuf),
}

/// Merge layer recording its calls, and whether the store was locked during each of them.
#[derive(Debug)]
pub struct RecordingMerge {
	store: Arc<MemoryStore>,
	pub calls: Mutex<Vec<(MergeCall, bool)>>,
	pub fail_on: Mutex<Option<PathBuf>>,
}

impl RecordingMerge {
	pub fn new(store: Arc<MemoryStore>) -> Arc<Self> {
		Arc::new(Self {
			store,
			calls: Mutex::new(Vec::new()),
			fail_on: Mutex::new(None),
		})
	}

	pub fn calls(&self) -> Vec<MergeCall> {
		self.calls.lock().iter().map(|(call, _)| call.clone()).collect()
	}

	pub fn always_locked(&self) -> bool {
		self.calls.lock().iter().all(|(_, locked)| *locked)
	}

	fn record(&self, path: &Path, call: MergeCall) -> Result<(), Error> {
		self.calls.lock().push((call, self.store.is_locked()));
		if self.fail_on.lock().as_deref() == Some(path) {
			return Err(Error::merge("refused by test"));
		}
		Ok(())
	}
}

#[async_trait]
impl Merge for RecordingMerge {
	async fn add_file(&self, _: Side, doc: LocalDocument) -> Result<(), Error> {
		self.record(&doc.path, MergeCall::AddFile(doc.path.clone()))
	}

	async fn update_file(&self, _: Side, doc: LocalDocument) -> Result<(), Error> {
		self.record(&doc.path, MergeCall::UpdateFile(doc.path.clone()))
	}

	async fn put_folder(&self, _: Side, doc: LocalDocument) -> Result<(), Error> {
		self.record(&doc.path, MergeCall::PutFolder(doc.path.clone()))
	}

	async fn move_file(&self, _: Side, doc: LocalDocument, was: Document) -> Result<(), Error> {
		self.record(
			&doc.path,
			MergeCall::MoveFile {
				from: was.path,
				to: doc.path.clone(),
				overwrite: doc.overwrite.is_some(),
			},
		)
	}

	async fn move_folder(&self, _: Side, doc: LocalDocument, was: Document) -> Result<(), Error> {
		self.record(
			&doc.path,
			MergeCall::MoveFolder {
				from: was.path,
				to: doc.path.clone(),
				overwrite: doc.overwrite.is_some(),
			},
		)
	}

	async fn trash_file(&self, _: Side, was: Document) -> Result<(), Error> {
		self.record(&was.path, MergeCall::TrashFile(was.path.clone()))
	}

	async fn trash_folder(&self, _: Side, was: Document) -> Result<(), Error> {
		self.record(&was.path, MergeCall::TrashFolder(was.path.clone()))
	}
}
