//! Periodic sync jobs.
//!
//! [`Scheduler`] collects hooks and options, then binds them to a producer
//! or consumer. Binding runs one cycle inline so the caller sees the first
//! result (and any configuration error) before anything is spawned. After
//! that a tokio task repeats the cycle on every tick until the returned
//! [`CronJob`] is stopped.

use crate::error::Result;
use crate::feed::{Consumer, IncrementalProducer, Producer, Reader, ReaderOptions, Status, Writer, WriterOptions};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BeforeHook = Arc<dyn Fn(i64) -> bool + Send + Sync>;
type AfterHook = Arc<dyn Fn(&Result<Status>) + Send + Sync>;
type VersionCheck = Arc<dyn Fn() -> BoxFuture<'static, Result<i64>> + Send + Sync>;
type Perform = Arc<dyn Fn(i64) -> BoxFuture<'static, Result<Status>> + Send + Sync>;
type LocalVersion = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Builder for periodic produce and consume jobs.
#[derive(Clone)]
pub struct Scheduler {
    interval: Duration,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
    version_check: Option<VersionCheck>,
    reader_opts: ReaderOptions,
    writer_opts: WriterOptions,
    parent: Option<CancellationToken>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("interval", &self.interval)
            .field("before_hooks", &self.before.len())
            .field("after_hooks", &self.after.len())
            .field("version_check", &self.version_check.is_some())
            .field("reader_opts", &self.reader_opts)
            .field("writer_opts", &self.writer_opts)
            .finish()
    }
}

impl Scheduler {
    /// Jobs that tick every `interval`. Intervals below one millisecond are
    /// raised to one millisecond.
    pub fn every(interval: Duration) -> Self {
        Scheduler {
            interval: interval.max(Duration::from_millis(1)),
            before: Vec::new(),
            after: Vec::new(),
            version_check: None,
            reader_opts: ReaderOptions::default(),
            writer_opts: WriterOptions::default(),
            parent: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Adds a hook run before each cycle with the current local version.
    /// Returning `false` skips the cycle without running after-hooks.
    pub fn before_sync<F>(mut self, hook: F) -> Self
    where
        F: Fn(i64) -> bool + Send + Sync + 'static,
    {
        self.before.push(Arc::new(hook));
        self
    }

    /// Adds a hook run after each cycle with its outcome.
    pub fn after_sync<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Result<Status>) + Send + Sync + 'static,
    {
        self.after.push(Arc::new(hook));
        self
    }

    /// Sets the function producers call before each cycle to learn the
    /// version of the local data. Without one, producers publish version 0.
    pub fn with_version_check<F, Fut>(mut self, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<i64>> + Send + 'static,
    {
        self.version_check = Some(Arc::new(move || check().boxed()));
        self
    }

    pub fn with_reader_options(mut self, opts: ReaderOptions) -> Self {
        self.reader_opts = opts;
        self
    }

    pub fn with_writer_options(mut self, opts: WriterOptions) -> Self {
        self.writer_opts = opts;
        self
    }

    /// Stops every job started from this scheduler when `token` is cancelled.
    pub fn with_context(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    /// Consumes the feed on every tick.
    pub async fn consume<F>(self, consumer: Arc<Consumer>, cfn: F) -> Result<CronJob>
    where
        F: for<'r> Fn(&'r mut Reader) -> BoxFuture<'r, Result<()>> + Send + Sync + 'static,
    {
        let cfn = Arc::new(cfn);
        let opts = self.reader_opts.clone();
        let version_of = consumer.clone();
        let perform: Perform = Arc::new(move |_| {
            let consumer = consumer.clone();
            let cfn = cfn.clone();
            let opts = opts.clone();
            async move { consumer.consume(&opts, &*cfn).await }.boxed()
        });
        let local: LocalVersion = Arc::new(move || version_of.version());
        self.start("consume", local, perform, false).await
    }

    /// Publishes the feed on every tick.
    pub async fn produce<F>(self, producer: Arc<Producer>, pfn: F) -> Result<CronJob>
    where
        F: Fn(&mut Writer) -> Result<()> + Send + Sync + 'static,
    {
        let pfn = Arc::new(pfn);
        let opts = self.writer_opts.clone();
        let version_of = producer.clone();
        let perform: Perform = Arc::new(move |version| {
            let producer = producer.clone();
            let pfn = pfn.clone();
            let opts = opts.clone();
            async move { producer.produce(version, &opts, &*pfn).await }.boxed()
        });
        let local: LocalVersion = Arc::new(move || version_of.version());
        self.start("produce", local, perform, true).await
    }

    /// Appends to an incremental feed on every tick.
    pub async fn produce_incrementally<F, P>(self, producer: Arc<IncrementalProducer>, ipfn: F) -> Result<CronJob>
    where
        F: Fn(i64) -> P + Send + Sync + 'static,
        P: FnOnce(&mut Writer) -> Result<()> + Send + 'static,
    {
        let ipfn = Arc::new(ipfn);
        let opts = self.writer_opts.clone();
        let version_of = producer.clone();
        let perform: Perform = Arc::new(move |version| {
            let producer = producer.clone();
            let ipfn = ipfn.clone();
            let opts = opts.clone();
            async move { producer.produce(version, &opts, &*ipfn).await }.boxed()
        });
        let local: LocalVersion = Arc::new(move || version_of.version());
        self.start("produce_incremental", local, perform, true).await
    }

    async fn start(
        self,
        kind: &'static str,
        local: LocalVersion,
        perform: Perform,
        is_producer: bool,
    ) -> Result<CronJob> {
        let cycle = Cycle {
            before: self.before,
            after: self.after,
            version_check: if is_producer { self.version_check } else { None },
            local,
            perform,
        };

        if let Some(Err(e)) = cycle.run().await {
            return Err(e);
        }

        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let token = cancel.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the bootstrap cycle covered it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                debug!(job = kind, "cycle abandoned on stop");
                                break;
                            }
                            res = cycle.run() => {
                                if let Some(Err(e)) = res {
                                    warn!(job = kind, error = %e, "scheduled cycle failed");
                                }
                            }
                        }
                    }
                }
            }
            debug!(job = kind, "job loop exited");
        });
        info!(job = kind, interval_ms = interval.as_millis() as u64, "job started");

        Ok(CronJob {
            cancel,
            handle: Some(handle),
        })
    }
}

/// Everything one tick needs.
struct Cycle {
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
    version_check: Option<VersionCheck>,
    local: LocalVersion,
    perform: Perform,
}

impl Cycle {
    /// Runs one cycle; `None` when a before-hook vetoed it.
    async fn run(&self) -> Option<Result<Status>> {
        let local = (self.local)();
        if !self.before.iter().all(|hook| hook(local)) {
            debug!(local_version = local, "cycle vetoed by before-hook");
            return None;
        }

        let result = match &self.version_check {
            Some(check) => match check().await {
                Ok(version) => (self.perform)(version).await,
                Err(e) => Err(e),
            },
            None => (self.perform)(0).await,
        };

        for hook in &self.after {
            hook(&result);
        }
        Some(result)
    }
}

/// Handle to a running job.
///
/// Dropping the handle cancels the job without waiting for it.
#[derive(Debug)]
pub struct CronJob {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CronJob {
    /// Cancels the job and waits for its loop to exit.
    ///
    /// A cycle in flight is dropped at its next await point, so its
    /// after-hooks do not run and nothing it had not yet committed is
    /// published. No cycle runs after this returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "job loop terminated abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CronJob {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::seed;
    use crate::error::FeedError;
    use crate::store::{InMemoryObjectStore, ObjectStore, RemoteObject};
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct Counters {
        before: AtomicI32,
        after: AtomicI32,
        cycles: AtomicI32,
        errors: AtomicI32,
    }

    fn remote() -> RemoteObject {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        RemoteObject::new(store, "file.json")
    }

    fn counted(c: &Arc<Counters>) -> Scheduler {
        let before = c.clone();
        let after = c.clone();
        Scheduler::every(Duration::from_millis(1))
            .before_sync(move |_| {
                before.before.fetch_add(1, Ordering::SeqCst);
                true
            })
            .after_sync(move |res| {
                after.after.fetch_add(1, Ordering::SeqCst);
                if res.is_err() {
                    after.errors.fetch_add(1, Ordering::SeqCst);
                }
            })
    }

    async fn run_and_stop(job: CronJob, c: &Counters) -> i32 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        job.stop().await;

        let ran = c.cycles.load(Ordering::SeqCst);
        assert!(ran >= 4, "expected at least 4 cycles, got {}", ran);
        assert_eq!(c.before.load(Ordering::SeqCst), ran);
        assert_eq!(c.after.load(Ordering::SeqCst), ran);
        assert_eq!(c.errors.load(Ordering::SeqCst), ran / 2);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.cycles.load(Ordering::SeqCst), ran, "no cycle after stop");
        ran
    }

    #[tokio::test]
    async fn test_produce_job() {
        let c = Arc::new(Counters::default());
        let producer = Arc::new(Producer::new(remote()));

        let cycles = c.clone();
        let job = counted(&c)
            .with_version_check(|| async { Ok::<_, FeedError>(101) })
            .produce(producer, move |_w| {
                // Nothing is written, so the remote never reaches 101 and
                // every tick produces again.
                if cycles.cycles.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                    return Err(FeedError::callback("failed!"));
                }
                Ok(())
            })
            .await
            .unwrap();
        run_and_stop(job, &c).await;
    }

    #[tokio::test]
    async fn test_produce_first_cycle_error() {
        let producer = Arc::new(Producer::new(remote()));
        let err = Scheduler::every(Duration::from_millis(1))
            .produce(producer, |_| Err(FeedError::callback("failed!")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "callback failed: failed!");
    }

    #[tokio::test]
    async fn test_consume_job() {
        let c = Arc::new(Counters::default());
        let consumer = Arc::new(Consumer::new(remote()));

        let cycles = c.clone();
        let job = counted(&c)
            .consume(consumer, move |_r| {
                let n = cycles.cycles.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n % 2 == 1 {
                        return Err(FeedError::callback("failed!"));
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();
        run_and_stop(job, &c).await;
    }

    #[tokio::test]
    async fn test_consume_first_cycle_error() {
        let consumer = Arc::new(Consumer::new(remote()));
        let res = Scheduler::every(Duration::from_millis(1))
            .consume(consumer, |_| Box::pin(async { Err::<(), _>(FeedError::callback("failed!")) }))
            .await;
        assert!(matches!(res, Err(FeedError::Callback(_))));
    }

    #[tokio::test]
    async fn test_before_hook_vetoes_cycle() {
        let c = Arc::new(Counters::default());
        let producer = Arc::new(Producer::new(remote()));

        let after = c.clone();
        let cycles = c.clone();
        let job = Scheduler::every(Duration::from_millis(1))
            .before_sync(|_| false)
            .after_sync(move |_| {
                after.after.fetch_add(1, Ordering::SeqCst);
            })
            .produce(producer, move |_| {
                cycles.cycles.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        job.stop().await;
        assert_eq!(c.cycles.load(Ordering::SeqCst), 0);
        assert_eq!(c.after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_version_check_error_reaches_after_hooks() {
        let producer = Arc::new(Producer::new(remote()));
        let seen = Arc::new(AtomicI32::new(0));

        let hook_seen = seen.clone();
        let res = Scheduler::every(Duration::from_millis(1))
            .after_sync(move |res| {
                if matches!(res, Err(FeedError::Config(_))) {
                    hook_seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .with_version_check(|| async { Err::<i64, _>(FeedError::Config("no source".into())) })
            .produce(producer.clone(), |_| Ok(()))
            .await;

        assert!(res.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(producer.last_attempt().is_zero(), "produce must not run");
    }

    #[tokio::test]
    async fn test_produce_job_publishes_and_then_skips() {
        let remote = remote();
        let producer = Arc::new(Producer::new(remote.clone()));
        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = statuses.clone();
        let job = Scheduler::every(Duration::from_millis(2))
            .after_sync(move |res| {
                if let Ok(status) = res {
                    sink.lock().push(*status);
                }
            })
            .with_version_check(|| async { Ok::<_, FeedError>(7) })
            .produce(producer.clone(), |w| w.encode(&seed(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        job.stop().await;

        let statuses = statuses.lock();
        assert!(statuses.len() >= 2);
        assert!(!statuses[0].skipped);
        assert!(statuses[1..].iter().all(|s| s.skipped));
        assert_eq!(producer.version(), 7);
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_slow_cycle() {
        let consumer = Arc::new(Consumer::new(remote()));
        let calls = Arc::new(AtomicI32::new(0));
        let finished = Arc::new(AtomicI32::new(0));

        let (c, f) = (calls.clone(), finished.clone());
        let job = Scheduler::every(Duration::from_millis(1))
            .consume(consumer, move |_r| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                let f = f.clone();
                Box::pin(async move {
                    if n > 0 {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        f.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok::<(), FeedError>(())
                })
            })
            .await
            .unwrap();

        for _ in 0..500 {
            if calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 2, "slow cycle never started");

        let started = tokio::time::Instant::now();
        job.stop().await;
        assert!(started.elapsed() < Duration::from_millis(500), "stop took {:?}", started.elapsed());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parent_token_stops_job() {
        let parent = CancellationToken::new();
        let producer = Arc::new(Producer::new(remote()));
        let job = Scheduler::every(Duration::from_millis(1))
            .with_context(parent.clone())
            .produce(producer, |_| Ok(()))
            .await
            .unwrap();
        assert!(job.is_running());

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!job.is_running());
        job.stop().await;
    }
}
