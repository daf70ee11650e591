//! Feed consumer.
//!
//! A consumer polls a feed and hands it to a callback only when the remote
//! version moved past the last version it consumed. The feed is either one
//! remote object or a bucket whose manifest lists the data files.

use crate::clock::{system_clock, SharedClock, Timestamp};
use crate::error::Result;
use crate::feed::manifest::{load_manifest, MANIFEST_NAME};
use crate::feed::reader::{Reader, ReaderOptions};
use crate::feed::version::{last_modified_from_meta, should_skip, version_from_meta};
use crate::feed::{Status, SyncState};
use crate::store::{Bucket, RemoteObject};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug)]
enum Source {
    Object(RemoteObject),
    Manifest { manifest: RemoteObject, bucket: Bucket },
}

/// Consumes a single-object or incremental feed.
///
/// Callbacks receive the reader for the duration of one cycle and return a
/// boxed future:
///
/// ```ignore
/// consumer
///     .consume(&ReaderOptions::default(), |r| {
///         Box::pin(async move {
///             while let Some(item) = r.decode::<Item>().await? {
///                 sink.send(item);
///             }
///             Ok(())
///         })
///     })
///     .await?;
/// ```
#[derive(Debug)]
pub struct Consumer {
    source: Source,
    owned: bool,
    closed: AtomicBool,
    clock: SharedClock,
    state: SyncState,
}

impl Consumer {
    fn with_source(source: Source, owned: bool) -> Self {
        Consumer {
            source,
            owned,
            closed: AtomicBool::new(false),
            clock: system_clock(),
            state: SyncState::default(),
        }
    }

    /// Consumer over a remote the caller keeps ownership of.
    pub fn new(remote: RemoteObject) -> Self {
        Self::with_source(Source::Object(remote), false)
    }

    /// Consumer that closes `remote` when it is closed.
    pub fn owned(remote: RemoteObject) -> Self {
        Self::with_source(Source::Object(remote), true)
    }

    /// Consumer of the incremental feed in `bucket`.
    pub fn incremental(bucket: Bucket) -> Self {
        let manifest = bucket.object(MANIFEST_NAME);
        Self::with_source(Source::Manifest { manifest, bucket }, false)
    }

    /// Incremental consumer that closes `bucket` when it is closed.
    pub fn incremental_owned(bucket: Bucket) -> Self {
        let manifest = bucket.object(MANIFEST_NAME);
        Self::with_source(Source::Manifest { manifest, bucket }, true)
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Reads the manifest from `name` instead of [`MANIFEST_NAME`].
    /// No effect on a single-object consumer.
    pub fn with_manifest_name(mut self, name: &str) -> Self {
        if let Source::Manifest { manifest, bucket } = &mut self.source {
            *manifest = bucket.object(name);
        }
        self
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self.source, Source::Manifest { .. })
    }

    /// The polled object: the feed itself, or its manifest.
    pub fn remote(&self) -> &RemoteObject {
        match &self.source {
            Source::Object(remote) => remote,
            Source::Manifest { manifest, .. } => manifest,
        }
    }

    /// Runs `cfn` over the feed if the remote version is newer than the one
    /// last consumed.
    ///
    /// On error nothing advances, so the next cycle retries the same data.
    pub async fn consume<F>(&self, opts: &ReaderOptions, cfn: F) -> Result<Status>
    where
        F: for<'r> FnOnce(&'r mut Reader) -> BoxFuture<'r, Result<()>>,
    {
        let span = info_span!("consume", key = self.remote().key());
        async {
            self.state.record_attempt(self.clock.now());

            let local_version = self.state.version();
            let head = self.remote().head().await?;
            let mut status = Status {
                local_version,
                remote_version: head.as_ref().map(version_from_meta).unwrap_or(0),
                ..Status::default()
            };
            if should_skip(status.remote_version, local_version) {
                debug!(remote_version = status.remote_version, local_version, "feed unchanged, skipping");
                status.skipped = true;
                return Ok(status);
            }
            let last_modified = head
                .as_ref()
                .map(last_modified_from_meta)
                .unwrap_or(Timestamp::ZERO);

            let mut reader = match &self.source {
                Source::Object(remote) => Reader::new(remote.clone(), opts),
                Source::Manifest { manifest, bucket } => {
                    let loaded = load_manifest(manifest).await?;
                    status.remote_version = loaded.version;
                    Reader::multi(loaded.remotes(bucket), opts)
                }
            };
            let res = cfn(&mut reader).await;
            reader.close();
            res?;

            status.num_items = reader.num_read();
            self.state
                .advance(status.remote_version, status.num_items, last_modified);
            info!(
                local_version,
                remote_version = status.remote_version,
                records = status.num_items,
                "feed consumed"
            );
            Ok(status)
        }
        .instrument(span)
        .await
    }

    pub fn last_attempt(&self) -> Timestamp {
        self.state.last_attempt()
    }

    /// Last-modified tag of the most recently consumed feed.
    pub fn last_modified(&self) -> Timestamp {
        self.state.last_modified()
    }

    /// Most recently consumed version.
    pub fn version(&self) -> i64 {
        self.state.version()
    }

    /// Records read by the last consuming cycle.
    pub fn num_read(&self) -> u64 {
        self.state.num_items()
    }

    /// Releases the remote or bucket if owned. Closing twice is harmless.
    pub async fn close(&self) -> Result<()> {
        if !self.owned || self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.source {
            Source::Object(remote) => remote.close().await,
            Source::Manifest { bucket, .. } => bucket.close().await,
        }
    }
}
