//! Configuration for feed synchronization
//!
//! Config structs are plain serde types so they can be loaded from TOML or
//! built in code. Every struct has a `Default` and a `test()` constructor.

use crate::codec::{Compression, Format};
use crate::error::{FeedError, Result};
use crate::feed::{Consumer, IncrementalProducer, ReaderOptions, WriterOptions};
use crate::store::{Bucket, InMemoryObjectStore, LocalFsObjectStore, ObjectStore, RemoteObject};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration of one synchronised feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Backend holding the feed
    pub store: StoreConfig,
    /// Object name of a single-object feed, relative to the store prefix
    pub remote: String,
    /// Manifest name of an incremental feed
    pub manifest: String,
    /// Polling interval of scheduled jobs
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Explicit format; detected from object names when unset
    pub format: Option<Format>,
    /// Explicit compression; detected from object names when unset
    pub compression: Option<Compression>,
    pub log: LogConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            store: StoreConfig::default(),
            remote: "feed.json.gz".to_string(),
            manifest: crate::feed::MANIFEST_NAME.to_string(),
            interval: Duration::from_secs(60),
            format: None,
            compression: None,
            log: LogConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Config for tests (in-memory store, fast polling)
    pub fn test() -> Self {
        FeedConfig {
            store: StoreConfig::test(),
            remote: "feed.json".to_string(),
            interval: Duration::from_millis(10),
            log: LogConfig::test(),
            ..FeedConfig::default()
        }
    }

    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: FeedConfig = toml::from_str(s).map_err(|e| FeedError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.is_empty() {
            return Err(FeedError::Config("remote must not be empty".to_string()));
        }
        if self.manifest.is_empty() {
            return Err(FeedError::Config("manifest must not be empty".to_string()));
        }
        if self.interval.is_zero() {
            return Err(FeedError::Config("interval must be positive".to_string()));
        }
        self.store.validate()
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            format: self.format,
            compression: self.compression,
            ..WriterOptions::default()
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            format: self.format,
            compression: self.compression,
        }
    }

    /// The single-object feed inside `bucket`.
    pub fn remote_object(&self, bucket: &Bucket) -> RemoteObject {
        bucket.object(&self.remote)
    }

    /// The manifest of the incremental feed inside `bucket`.
    pub fn manifest_object(&self, bucket: &Bucket) -> RemoteObject {
        bucket.object(&self.manifest)
    }

    pub fn incremental_producer(&self, bucket: Bucket) -> IncrementalProducer {
        IncrementalProducer::new(bucket).with_manifest_name(&self.manifest)
    }

    pub fn incremental_consumer(&self, bucket: Bucket) -> Consumer {
        Consumer::incremental(bucket).with_manifest_name(&self.manifest)
    }
}

/// Type of object store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStoreType {
    /// In-memory store (for tests)
    InMemory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible
    #[cfg(feature = "s3")]
    S3,
}

/// Object store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_type: ObjectStoreType,
    /// Key prefix applied by [`StoreConfig::bucket`]
    pub prefix: String,
    /// Root directory (for LocalFs store)
    pub local_path: Option<PathBuf>,
    /// S3 configuration (for S3 store)
    #[cfg(feature = "s3")]
    pub s3: Option<S3Config>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            store_type: ObjectStoreType::InMemory,
            prefix: "feeds".to_string(),
            local_path: None,
            #[cfg(feature = "s3")]
            s3: None,
        }
    }
}

impl StoreConfig {
    /// Create config for local development
    pub fn local(path: PathBuf) -> Self {
        StoreConfig {
            store_type: ObjectStoreType::LocalFs,
            local_path: Some(path),
            ..StoreConfig::default()
        }
    }

    /// Create config for testing (in-memory)
    pub fn test() -> Self {
        StoreConfig {
            prefix: "test".to_string(),
            ..StoreConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.store_type {
            ObjectStoreType::InMemory => Ok(()),
            ObjectStoreType::LocalFs if self.local_path.is_none() => Err(FeedError::Config(
                "local_path is required for the LocalFs store".to_string(),
            )),
            ObjectStoreType::LocalFs => Ok(()),
            #[cfg(feature = "s3")]
            ObjectStoreType::S3 if self.s3.is_none() => Err(FeedError::Config(
                "s3 section is required for the S3 store".to_string(),
            )),
            #[cfg(feature = "s3")]
            ObjectStoreType::S3 => Ok(()),
        }
    }

    /// Instantiate the configured backend.
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>> {
        self.validate()?;
        let store: Arc<dyn ObjectStore> = match self.store_type {
            ObjectStoreType::InMemory => Arc::new(InMemoryObjectStore::new()),
            ObjectStoreType::LocalFs => {
                let path = self.local_path.clone().unwrap_or_default();
                Arc::new(LocalFsObjectStore::new(path))
            }
            #[cfg(feature = "s3")]
            ObjectStoreType::S3 => {
                let s3 = self.s3.as_ref().ok_or_else(|| {
                    FeedError::Config("s3 section is required for the S3 store".to_string())
                })?;
                Arc::new(crate::store::S3ObjectStore::new(s3)?)
            }
        };
        Ok(store)
    }

    /// Build the backend and scope it to `prefix`.
    pub fn bucket(&self) -> Result<Bucket> {
        Ok(Bucket::with_prefix(self.build()?, self.prefix.clone()))
    }
}

/// S3 configuration
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Key prefix within bucket
    pub prefix: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence
    pub filter: String,
    /// Emit JSON lines instead of the human-readable layout
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl LogConfig {
    pub fn test() -> Self {
        LogConfig {
            filter: "debug".to_string(),
            json: false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
