//! Versioned feed synchronization over object stores.
//!
//! A producer publishes a feed (a stream of records) into an object store
//! together with a version tag; consumers poll the tag and re-read the feed
//! only when it moved. Feeds are either one object or an append-only set of
//! delta files listed by a manifest.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod feed;
pub mod schedule;
pub mod store;
pub mod telemetry;

pub use clock::{Clock, ProductionClock, SharedClock, SimulatedClock, Timestamp};
pub use codec::{Compression, Format, Record};
pub use config::{FeedConfig, LogConfig, ObjectStoreType, StoreConfig};
pub use error::{BoxError, FeedError, Result};
pub use feed::{
    load_manifest, should_skip, Consumer, IncrementalProducer, Manifest, Producer, Reader,
    ReaderIter, ReaderOptions, Status, Writer, WriterOptions, MANIFEST_NAME,
};
pub use schedule::{CronJob, Scheduler};
pub use store::{Bucket, InMemoryObjectStore, LocalFsObjectStore, ObjectStore, RemoteObject};

#[doc(hidden)]
pub mod __private {
    pub use prost;
}
