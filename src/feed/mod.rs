//! Feed publishing and consumption.
//!
//! - [`Producer`] writes a whole feed into one object when its version moves
//! - [`IncrementalProducer`] appends delta files to a bucket behind a manifest
//! - [`Consumer`] reads a single-object or manifest-backed feed when the
//!   remote version moves past the last one it consumed
//!
//! Every cycle returns a [`Status`] describing what happened.

pub mod consumer;
pub mod manifest;
pub mod producer;
pub mod reader;
pub mod version;
pub mod writer;

pub use consumer::Consumer;
pub use manifest::{load_manifest, Manifest, MANIFEST_NAME};
pub use producer::{IncrementalProducer, Producer};
pub use reader::{Reader, ReaderIter, ReaderOptions};
pub use version::should_skip;
pub use writer::{Writer, WriterOptions};

use crate::clock::Timestamp;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Outcome of one produce or consume attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    /// No data moved because the versions said there was nothing to do
    pub skipped: bool,
    /// Version held locally when the attempt started
    pub local_version: i64,
    /// Version found on the remote side
    pub remote_version: i64,
    /// Records written or read
    pub num_items: u64,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "skipped:{} version:{}->{} items:{}",
            self.skipped, self.local_version, self.remote_version, self.num_items
        )
    }
}

/// Sync progress shared between the cycle that mutates it and any number
/// of observers.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    last_attempt: AtomicI64,
    last_modified: AtomicI64,
    version: AtomicI64,
    num_items: AtomicU64,
}

impl SyncState {
    pub(crate) fn record_attempt(&self, at: Timestamp) {
        self.last_attempt.store(at.0, Ordering::Release);
    }

    /// Publishes the result of a successful cycle.
    pub(crate) fn advance(&self, version: i64, num_items: u64, last_modified: Timestamp) {
        self.num_items.store(num_items, Ordering::Release);
        self.last_modified.store(last_modified.0, Ordering::Release);
        self.version.store(version, Ordering::Release);
    }

    pub(crate) fn last_attempt(&self) -> Timestamp {
        Timestamp(self.last_attempt.load(Ordering::Acquire))
    }

    pub(crate) fn last_modified(&self) -> Timestamp {
        Timestamp(self.last_modified.load(Ordering::Acquire))
    }

    pub(crate) fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn num_items(&self) -> u64 {
        self.num_items.load(Ordering::Acquire)
    }
}
