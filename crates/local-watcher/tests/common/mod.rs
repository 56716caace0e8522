use sd_local_watcher::{
	Collaborators, DocId, DocKind, Document, DocumentStore, Error, Identity, IgnoreList,
	LocalDocument, Md5Checksumer, Merge, Side, StoreLock,
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
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

/// Logs for tests not using `#[traced_test]`, filtered with `RUST_LOG`.
pub fn init_logs() {
	// Only the first test of the binary gets to install it
	let _ = tracing_subscriber::fmt()
		.with_file(true)
		.with_line_number(true)
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merged {
	Added(PathBuf),
	Updated(PathBuf),
	Folder(PathBuf),
	Moved { from: PathBuf, to: PathBuf },
	Trashed(PathBuf),
}

/// Document store applying merged changes to an in memory tree.
#[derive(Debug, Default)]
pub struct SyncedTree {
	docs: Mutex<HashMap<DocId, Document>>,
	merged: Mutex<Vec<Merged>>,
	lock: Arc<tokio::sync::Mutex<()>>,
	seq: AtomicU64,
}

impl SyncedTree {
	pub fn new(docs: impl IntoIterator<Item = Document>) -> Arc<Self> {
		let tree = Self::default();
		for doc in docs {
			tree.docs.lock().insert(doc.id.clone(), doc);
		}
		Arc::new(tree)
	}

	pub fn collaborators(self: &Arc<Self>, ignored: &[&str]) -> Collaborators {
		Collaborators {
			store: Arc::clone(self) as Arc<dyn DocumentStore>,
			merge: Arc::clone(self) as Arc<dyn Merge>,
			ignore: Arc::new(IgnoreList::new(ignored.iter().copied())),
			hasher: Arc::new(Md5Checksumer::default()),
		}
	}

	pub fn merged(&self) -> Vec<Merged> {
		self.merged.lock().clone()
	}

	pub fn doc(&self, path: &str) -> Option<Document> {
		self.docs.lock().get(&DocId::from_path(path)).cloned()
	}

	/// Wait until the merge layer got a change matching `predicate`.
	pub async fn wait_for(&self, predicate: impl Fn(&Merged) -> bool) -> bool {
		let deadline = Instant::now() + Duration::from_secs(10);
		while Instant::now() < deadline {
			if self.merged.lock().iter().any(&predicate) {
				return true;
			}
			sleep(Duration::from_millis(50)).await;
		}
		false
	}

	fn apply(&self, change: Merged, doc: Option<LocalDocument>) {
		if let Some(local) = doc {
			let mut doc = Document::new(&local.path, local.kind);
			if let Some(identity) = local.identity {
				doc = doc.with_identity(identity);
			}
			doc.md5sum = local.md5sum;
			doc.updated_at = local.updated_at.unwrap_or(SystemTime::UNIX_EPOCH);
			self.docs.lock().insert(doc.id.clone(), doc);
		}

		self.seq.fetch_add(1, Ordering::Relaxed);
		self.merged.lock().push(change);
	}

	fn remove(&self, path: &Path) {
		self.docs.lock().remove(&DocId::from_path(path));
	}
}

#[async_trait]
impl DocumentStore for SyncedTree {
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

	async fn previous_revision(&self, _: &DocId) -> Result<Option<Document>, Error> {
		Ok(None)
	}
}

#[async_trait]
impl Merge for SyncedTree {
	async fn add_file(&self, _: Side, doc: LocalDocument) -> Result<(), Error> {
		self.apply(Merged::Added(doc.path.clone()), Some(doc));
		Ok(())
	}

	async fn update_file(&self, _: Side, doc: LocalDocument) -> Result<(), Error> {
		self.apply(Merged::Updated(doc.path.clone()), Some(doc));
		Ok(())
	}

	async fn put_folder(&self, _: Side, doc: LocalDocument) -> Result<(), Error> {
		self.apply(Merged::Folder(doc.path.clone()), Some(doc));
		Ok(())
	}

	async fn move_file(&self, _: Side, doc: LocalDocument, was: Document) -> Result<(), Error> {
		self.remove(&was.path);
		self.apply(
			Merged::Moved {
				from: was.path,
				to: doc.path.clone(),
			},
			Some(doc),
		);
		Ok(())
	}

	async fn move_folder(&self, side: Side, doc: LocalDocument, was: Document) -> Result<(), Error> {
		// Descendants follow their folder
		let prefix = was.path.clone();
		let moved = self
			.docs
			.lock()
			.values()
			.filter(|child| child.path.starts_with(&prefix) && child.path != prefix)
			.cloned()
			.collect::<Vec<_>>();

		for mut child in moved {
			self.remove(&child.path);
			if let Ok(relative) = child.path.strip_prefix(&prefix) {
				child.path = doc.path.join(relative);
				child.id = DocId::from_path(&child.path);
			}
			self.docs.lock().insert(child.id.clone(), child);
		}

		self.move_file(side, doc, was).await
	}

	async fn trash_file(&self, _: Side, was: Document) -> Result<(), Error> {
		self.remove(&was.path);
		self.apply(Merged::Trashed(was.path), None);
		Ok(())
	}

	async fn trash_folder(&self, side: Side, was: Document) -> Result<(), Error> {
		self.trash_file(side, was).await
	}
}

/// Inodes far from the ones of the temporary directories the tests run in.
const UNUSED_INO_BASE: u64 = u64::MAX - 1_000_000;

pub fn folder(path: &str, ino: u64) -> Document {
	Document::new(path, DocKind::Folder).with_identity(Identity::Inode(UNUSED_INO_BASE + ino))
}

pub fn file(path: &str, ino: u64) -> Document {
	Document::new(path, DocKind::File).with_identity(Identity::Inode(UNUSED_INO_BASE + ino))
}
