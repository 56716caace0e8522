//!
//! # Local Watcher
//!
//! Spacedrive's Local Watcher turns the raw, platform specific and sometimes unreliable file system
//! notifications of a synchronized directory into an ordered sequence of canonical change events
//! (created, modified, deleted and renamed files and directories, with their content checksum),
//! ready to be merged into the shared document tree.
//!
//! The watcher is built as a chain of steps. Each step is a task owning its own state that pops
//! batches of events from a [`Channel`] and pushes the batches it produced into the next one:
//! - The producer watches the synchronized directory and scans it on startup;
//! - `add_infos` and `filter_ignored` enrich events with file system stats and drop ignored paths;
//! - On platforms whose backend can't report moves, `identical_renaming` and `detect_move` rebuild
//!   renames from deletion and creation pairs;
//! - `scan_folder`, `await_write_finish`, `initial_diff`, `add_checksum`, `incomplete_fixer` and
//!   `overwrite` stabilize and complete events;
//! - Finally the [`Dispatcher`] calls the [`Merge`] layer once per event, holding the store lock.
//!
//! ## Basic example
//!
//! ```no_run
//! use sd_local_watcher::{ChannelWatcher, Collaborators, WatcherConfig};
//!
//! # async fn run(collaborators: Collaborators) -> Result<(), sd_local_watcher::Error> {
//! let mut watcher = ChannelWatcher::new(WatcherConfig::new("/home/user/Sync"), collaborators)?;
//!
//! // Resolves once the initial scan went through the whole pipeline
//! watcher.start().await?;
//!
//! let fatal = watcher.wait_fatal().await;
//! tracing::error!(?fatal, "Local watcher stopped;");
//!
//! watcher.stop().await;
//! # Ok(())
//! # }
//! ```
#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod channel;
mod checksum;
mod config;
mod dispatch;
mod error;
mod event;
mod ignore;
mod platform;
mod producer;
mod provenance;
mod signals;
mod stats;
mod store;
mod watcher;

pub mod steps;

#[cfg(test)]
mod test_utils;

pub use channel::{Batch, Channel};
pub use checksum::{ContentHasher, Md5Checksumer};
pub use config::WatcherConfig;
pub use dispatch::Dispatcher;
pub use error::{ConfigError, Error, FileIOError};
pub use event::{Action, Event, EventId, Identity, Incomplete, Kind};
pub use ignore::{IgnoreList, IgnoreRules};
pub use platform::{InotifyBackend, PlatformWatchBackend, RawChange, ReadDirectoryChangesBackend};
pub use producer::{Producer, Scanner};
pub use provenance::{AuditLog, AuditRecord};
pub use signals::{Signals, WatcherSignal};
pub use stats::{stat, stat_maybe, Stats};
pub use store::{
	DocId, DocKind, Document, DocumentStore, LocalDocument, Merge, MoveFrom, Side, StoreLock,
};
pub use watcher::{ChannelWatcher, Collaborators};
