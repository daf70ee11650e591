//! Feed producers.
//!
//! A producer publishes local data when the local version is newer than
//! the remote one. [`Producer`] rewrites a single object on each change;
//! [`IncrementalProducer`] appends one delta file per change to a bucket and
//! lists it in the feed's manifest.

use crate::clock::{system_clock, SharedClock, Timestamp};
use crate::error::Result;
use crate::feed::manifest::{load_manifest, Manifest, MANIFEST_NAME};
use crate::feed::version::{fetch_remote_version, should_skip};
use crate::feed::writer::{Writer, WriterOptions};
use crate::feed::{Status, SyncState};
use crate::store::{Bucket, RemoteObject};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, info_span, Instrument};

/// Publishes a feed into a single remote object.
#[derive(Debug)]
pub struct Producer {
    remote: RemoteObject,
    owned: bool,
    closed: AtomicBool,
    clock: SharedClock,
    state: SyncState,
}

impl Producer {
    /// Producer over a remote the caller keeps ownership of.
    pub fn new(remote: RemoteObject) -> Self {
        Producer {
            remote,
            owned: false,
            closed: AtomicBool::new(false),
            clock: system_clock(),
            state: SyncState::default(),
        }
    }

    /// Producer that closes `remote` when it is closed.
    pub fn owned(remote: RemoteObject) -> Self {
        Producer {
            owned: true,
            ..Self::new(remote)
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn remote(&self) -> &RemoteObject {
        &self.remote
    }

    /// Publishes `version` unless the remote already holds it or a newer one.
    ///
    /// `pfn` receives a writer tagged with `version` and encodes the data.
    /// Local state advances only after the object is committed.
    pub async fn produce<F>(&self, version: i64, opts: &WriterOptions, pfn: F) -> Result<Status>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        let span = info_span!("produce", key = self.remote.key(), version);
        async {
            let now = self.clock.now();
            self.state.record_attempt(now);

            let remote_version = fetch_remote_version(&self.remote).await?;
            let mut status = Status {
                local_version: version,
                remote_version,
                ..Status::default()
            };
            if should_skip(version, remote_version) {
                debug!(remote_version, "remote is current, skipping");
                status.skipped = true;
                return Ok(status);
            }

            let wopts = WriterOptions {
                version,
                last_modified: Some(opts.last_modified.unwrap_or(now)),
                ..opts.clone()
            };
            let mut writer = Writer::with_clock(self.remote.clone(), &wopts, self.clock.as_ref());
            if let Err(e) = pfn(&mut writer) {
                let _ = writer.discard();
                return Err(e);
            }
            writer.commit().await?;

            status.num_items = writer.num_written();
            self.state
                .advance(version, status.num_items, writer.last_modified());
            info!(remote_version, records = status.num_items, "feed produced");
            Ok(status)
        }
        .instrument(span)
        .await
    }

    /// Time of the last produce attempt.
    pub fn last_attempt(&self) -> Timestamp {
        self.state.last_attempt()
    }

    /// Last-modified tag of the last published object.
    pub fn last_modified(&self) -> Timestamp {
        self.state.last_modified()
    }

    /// Most recently published version.
    pub fn version(&self) -> i64 {
        self.state.version()
    }

    /// Records written by the last publishing cycle.
    pub fn num_written(&self) -> u64 {
        self.state.num_items()
    }

    /// Releases the remote if owned. Closing twice is harmless.
    pub async fn close(&self) -> Result<()> {
        if self.owned && !self.closed.swap(true, Ordering::AcqRel) {
            self.remote.close().await?;
        }
        Ok(())
    }
}

/// Publishes a feed as append-only delta files listed in a manifest.
#[derive(Debug)]
pub struct IncrementalProducer {
    bucket: Bucket,
    manifest: RemoteObject,
    owned: bool,
    closed: AtomicBool,
    check_on_commit: bool,
    clock: SharedClock,
    state: SyncState,
}

impl IncrementalProducer {
    /// Producer over a bucket the caller keeps ownership of.
    pub fn new(bucket: Bucket) -> Self {
        IncrementalProducer {
            manifest: bucket.object(MANIFEST_NAME),
            bucket,
            owned: false,
            closed: AtomicBool::new(false),
            check_on_commit: false,
            clock: system_clock(),
            state: SyncState::default(),
        }
    }

    /// Producer that closes `bucket` when it is closed.
    pub fn owned(bucket: Bucket) -> Self {
        IncrementalProducer {
            owned: true,
            ..Self::new(bucket)
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Uses `name` instead of [`MANIFEST_NAME`] for the manifest object.
    pub fn with_manifest_name(mut self, name: &str) -> Self {
        self.manifest = self.bucket.object(name);
        self
    }

    /// Re-reads the manifest right before committing it and fails with
    /// `VersionConflict` if another writer advanced it in the meantime.
    /// Off by default: the last writer wins.
    pub fn with_version_check_on_commit(mut self, enabled: bool) -> Self {
        self.check_on_commit = enabled;
        self
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// Handle to the feed's manifest object.
    pub fn manifest(&self) -> &RemoteObject {
        &self.manifest
    }

    /// Appends the changes up to `version` unless the manifest already
    /// covers it.
    ///
    /// `ipfn` is called with the manifest's previous version and returns the
    /// function that encodes everything changed since then.
    pub async fn produce<F, P>(&self, version: i64, opts: &WriterOptions, ipfn: F) -> Result<Status>
    where
        F: FnOnce(i64) -> P,
        P: FnOnce(&mut Writer) -> Result<()>,
    {
        let span = info_span!("produce_incremental", key = self.manifest.key(), version);
        async {
            let now = self.clock.now();
            self.state.record_attempt(now);

            let mut manifest = load_manifest(&self.manifest).await?;
            let since = manifest.version;
            let mut status = Status {
                local_version: version,
                remote_version: since,
                ..Status::default()
            };
            if should_skip(version, since) {
                debug!(manifest_version = since, "manifest is current, skipping");
                status.skipped = true;
                return Ok(status);
            }

            let last_modified = opts.last_modified.unwrap_or(now);
            let wopts = WriterOptions {
                version,
                last_modified: Some(last_modified),
                ..opts.clone()
            };
            status.num_items = manifest
                .write_data_file(&self.bucket, &wopts, ipfn(since))
                .await?;

            if self.check_on_commit {
                let current = load_manifest(&self.manifest).await?;
                Manifest::ensure_version(&current, since)?;
            }
            manifest.commit(&self.manifest, last_modified).await?;

            self.state.advance(version, status.num_items, last_modified);
            info!(
                since,
                files = manifest.files.len(),
                records = status.num_items,
                "incremental feed produced"
            );
            Ok(status)
        }
        .instrument(span)
        .await
    }

    pub fn last_attempt(&self) -> Timestamp {
        self.state.last_attempt()
    }

    pub fn last_modified(&self) -> Timestamp {
        self.state.last_modified()
    }

    pub fn version(&self) -> i64 {
        self.state.version()
    }

    /// Records written into the last delta file.
    pub fn num_written(&self) -> u64 {
        self.state.num_items()
    }

    /// Releases the bucket if owned.
    pub async fn close(&self) -> Result<()> {
        if self.owned && !self.closed.swap(true, Ordering::AcqRel) {
            self.bucket.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::codec::{seed, TestRecord};
    use crate::error::FeedError;
    use crate::feed::reader::{Reader, ReaderOptions};
    use crate::feed::version::fetch_last_modified;
    use crate::store::{
        InMemoryObjectStore, ObjectStore, SimulatedObjectStore, SimulatedStoreConfig,
    };
    use std::sync::Arc;

    fn memory() -> (InMemoryObjectStore, Arc<dyn ObjectStore>) {
        let store = InMemoryObjectStore::new();
        let shared: Arc<dyn ObjectStore> = Arc::new(store.clone());
        (store, shared)
    }

    fn write_two(w: &mut Writer) -> Result<()> {
        w.encode(&seed(1))?;
        w.encode(&seed(2))
    }

    #[tokio::test]
    async fn test_produce_then_skip() {
        let (mem, store) = memory();
        let clock = SimulatedClock::new(1_515_151_515_000);
        let p = Producer::new(RemoteObject::new(store, "path/to/file.json"))
            .with_clock(Arc::new(clock.clone()));

        let status = p.produce(101, &WriterOptions::default(), write_two).await.unwrap();
        assert_eq!(
            status,
            Status {
                skipped: false,
                local_version: 101,
                remote_version: 0,
                num_items: 2
            }
        );
        assert_eq!(p.version(), 101);
        assert_eq!(p.num_written(), 2);
        assert_eq!(p.last_attempt(), Timestamp(1_515_151_515_000));
        assert_eq!(p.last_modified(), Timestamp(1_515_151_515_000));

        clock.advance_ms(1_000);
        let status = p.produce(101, &WriterOptions::default(), write_two).await.unwrap();
        assert_eq!(
            status,
            Status {
                skipped: true,
                local_version: 101,
                remote_version: 101,
                num_items: 0
            }
        );
        assert_eq!(p.last_attempt(), Timestamp(1_515_151_516_000));
        assert_eq!(mem.put_count(), 1, "one write for two calls");
    }

    #[tokio::test]
    async fn test_produce_records_are_readable() {
        let (_, store) = memory();
        let remote = RemoteObject::new(store, "feed.pb.zst");
        let p = Producer::new(remote.clone());
        p.produce(5, &WriterOptions::default().with_last_modified(Timestamp(42)), write_two)
            .await
            .unwrap();

        let mut r = Reader::new(remote.clone(), &ReaderOptions::default());
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), Some(seed(1)));
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), Some(seed(2)));
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), None);
        assert_eq!(fetch_last_modified(&remote).await.unwrap(), Timestamp(42));
    }

    #[tokio::test]
    async fn test_older_version_is_skipped() {
        let (_, store) = memory();
        let p = Producer::new(RemoteObject::new(store, "feed.json"));
        p.produce(10, &WriterOptions::default(), write_two).await.unwrap();

        let status = p.produce(9, &WriterOptions::default(), write_two).await.unwrap();
        assert!(status.skipped);
        assert_eq!(p.version(), 10);
    }

    #[tokio::test]
    async fn test_callback_error_keeps_state() {
        let (mem, store) = memory();
        let p = Producer::new(RemoteObject::new(store, "feed.json"));

        let err = p
            .produce(3, &WriterOptions::default(), |w| {
                w.encode(&seed(1))?;
                Err(FeedError::callback("database offline"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Callback(_)));
        assert_eq!(p.version(), 0);
        assert_eq!(mem.put_count(), 0);
        assert!(!p.last_attempt().is_zero());
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_state() {
        let sim = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            7,
            SimulatedStoreConfig {
                put_fail_prob: 1.0,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let store: Arc<dyn ObjectStore> = Arc::new(sim.clone());
        let p = Producer::new(RemoteObject::new(store, "feed.json"));

        assert!(p.produce(3, &WriterOptions::default(), write_two).await.is_err());
        assert_eq!(p.version(), 0);
        assert_eq!(p.num_written(), 0);
        assert_eq!(sim.stats().put_failures, 1);
    }

    #[tokio::test]
    async fn test_owned_remote_closed_once() {
        let sim = SimulatedObjectStore::new(InMemoryObjectStore::new(), 1, SimulatedStoreConfig::no_faults());
        let store: Arc<dyn ObjectStore> = Arc::new(sim.clone());

        let borrowed = Producer::new(RemoteObject::new(store.clone(), "a.json"));
        borrowed.close().await.unwrap();
        assert_eq!(sim.stats().closes, 0);

        let owned = Producer::owned(RemoteObject::new(store, "b.json"));
        owned.close().await.unwrap();
        owned.close().await.unwrap();
        assert_eq!(sim.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_incremental_produce() {
        let (_, store) = memory();
        let bucket = Bucket::with_prefix(store, "feeds/items");
        let p = IncrementalProducer::new(bucket.clone());

        let status = p
            .produce(33, &WriterOptions::default(), |since| {
                assert_eq!(since, 0);
                write_two
            })
            .await
            .unwrap();
        assert!(!status.skipped);
        assert_eq!(status.num_items, 2);
        assert_eq!(p.version(), 33);

        let manifest = load_manifest(p.manifest()).await.unwrap();
        assert_eq!(
            manifest,
            Manifest {
                version: 33,
                generation: 0,
                files: vec!["data-0-33.json.gz".into()],
            }
        );

        let status = p
            .produce(33, &WriterOptions::default(), |_| write_two)
            .await
            .unwrap();
        assert!(status.skipped);
        assert_eq!(status.remote_version, 33);

        p.produce(40, &WriterOptions::default(), |since| {
            assert_eq!(since, 33);
            |w: &mut Writer| w.encode(&seed(3))
        })
        .await
        .unwrap();
        let manifest = load_manifest(p.manifest()).await.unwrap();
        assert_eq!(manifest.files, vec!["data-0-33.json.gz", "data-0-40.json.gz"]);
    }

    #[tokio::test]
    async fn test_incremental_unversioned_produce_appends() {
        let (_, store) = memory();
        let bucket = Bucket::with_prefix(store, "feeds/items");
        let p = IncrementalProducer::new(bucket.clone());

        for id in [1, 2] {
            let status = p
                .produce(0, &WriterOptions::default(), |_| {
                    move |w: &mut Writer| w.encode(&seed(id))
                })
                .await
                .unwrap();
            assert!(!status.skipped);
        }

        let manifest = load_manifest(p.manifest()).await.unwrap();
        assert_eq!(manifest.files, vec!["data-0-0.json.gz", "data-0-0-1.json.gz"]);

        let mut r = Reader::multi(manifest.remotes(&bucket), &ReaderOptions::default());
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), Some(seed(1)));
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), Some(seed(2)));
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incremental_custom_manifest_name() {
        let (_, store) = memory();
        let bucket = Bucket::with_prefix(store, "feeds/items");
        let p = IncrementalProducer::new(bucket.clone()).with_manifest_name("index.json");

        p.produce(7, &WriterOptions::default(), |_| write_two).await.unwrap();
        assert_eq!(p.manifest().key(), "feeds/items/index.json");
        assert_eq!(load_manifest(p.manifest()).await.unwrap().version, 7);
        assert!(bucket.object(MANIFEST_NAME).head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incremental_version_check_on_commit() {
        let (_, store) = memory();
        let bucket = Bucket::new(store);
        let p = IncrementalProducer::new(bucket.clone()).with_version_check_on_commit(true);
        let manifest_obj = p.manifest().clone();

        let err = p
            .produce(2, &WriterOptions::default(), |_| {
                move |w: &mut Writer| {
                    // A rival writer publishes while this one is producing.
                    let rival = Manifest {
                        version: 1,
                        ..Manifest::default()
                    };
                    futures::executor::block_on(rival.commit(&manifest_obj, Timestamp(1)))?;
                    w.encode(&seed(9))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FeedError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(p.version(), 0);
        assert_eq!(load_manifest(p.manifest()).await.unwrap().version, 1);
    }
}
