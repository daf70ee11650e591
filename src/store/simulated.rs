//! Simulated Object Store with Fault Injection
//!
//! DST-compatible wrapper that injects faults from a seeded RNG. Two stores
//! built with the same seed and config fail identically for the same
//! sequence of operations.

use super::{ListResult, Metadata, ObjectMeta, ObjectStore};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of PUT failure
    pub put_fail_prob: f64,
    /// Probability of GET failure
    pub get_fail_prob: f64,
    /// Probability of HEAD failure
    pub head_fail_prob: f64,
    /// Probability of any operation timing out
    pub timeout_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,
            get_fail_prob: 0.01,
            head_fail_prob: 0.01,
            timeout_prob: 0.005,
            latency_range_us: (0, 200),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.1,
            get_fail_prob: 0.1,
            head_fail_prob: 0.05,
            timeout_prob: 0.02,
            latency_range_us: (0, 1_000),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            head_fail_prob: 0.0,
            timeout_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub head_attempts: u64,
    pub head_failures: u64,
    pub timeouts: u64,
    pub closes: u64,
}

#[derive(Debug)]
struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Put,
    Get,
    Head,
}

/// Object store that wraps another store and injects faults
#[derive(Debug, Clone)]
pub struct SimulatedObjectStore<S: ObjectStore + Clone> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: ObjectStore + Clone> SimulatedObjectStore<S> {
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    /// Rolls the dice for one operation. Returns the injected error, if any,
    /// and the latency to apply before touching the inner store.
    fn roll(&self, op: Op) -> (Option<IoError>, Duration) {
        let mut s = self.state.lock();
        let fail_prob = match op {
            Op::Put => {
                s.stats.put_attempts += 1;
                self.config.put_fail_prob
            }
            Op::Get => {
                s.stats.get_attempts += 1;
                self.config.get_fail_prob
            }
            Op::Head => {
                s.stats.head_attempts += 1;
                self.config.head_fail_prob
            }
        };

        let (min, max) = self.config.latency_range_us;
        let latency = if max > min {
            Duration::from_micros(s.rng.gen_range(min..max))
        } else {
            Duration::from_micros(min)
        };

        if s.rng.gen_bool(self.config.timeout_prob.clamp(0.0, 1.0)) {
            s.stats.timeouts += 1;
            return (
                Some(IoError::new(ErrorKind::TimedOut, "simulated timeout")),
                latency,
            );
        }

        if s.rng.gen_bool(fail_prob.clamp(0.0, 1.0)) {
            let msg = match op {
                Op::Put => {
                    s.stats.put_failures += 1;
                    "simulated put failure"
                }
                Op::Get => {
                    s.stats.get_failures += 1;
                    "simulated get failure"
                }
                Op::Head => {
                    s.stats.head_failures += 1;
                    "simulated head failure"
                }
            };
            return (Some(IoError::new(ErrorKind::Other, msg)), latency);
        }

        (None, latency)
    }

    async fn delay(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl<S: ObjectStore + Clone> ObjectStore for SimulatedObjectStore<S> {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
        metadata: &'a Metadata,
    ) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let (fault, latency) = self.roll(Op::Put);
            Self::delay(latency).await;
            if let Some(err) = fault {
                return Err(err);
            }
            self.inner_store.put(key, data, metadata).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Bytes>> {
        Box::pin(async move {
            let (fault, latency) = self.roll(Op::Get);
            Self::delay(latency).await;
            if let Some(err) = fault {
                return Err(err);
            }
            self.inner_store.get(key).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(async move {
            let (fault, latency) = self.roll(Op::Head);
            Self::delay(latency).await;
            if let Some(err) = fault {
                return Err(err);
            }
            self.inner_store.head(key).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        self.inner_store.delete(key)
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        self.inner_store.list(prefix, continuation_token)
    }

    fn close(&self) -> BoxFuture<'_, IoResult<()>> {
        self.state.lock().stats.closes += 1;
        self.inner_store.close()
    }
}
