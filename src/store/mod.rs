//! Object Store Abstraction
//!
//! Feeds live in object stores. This module provides the store trait plus
//! the two handles the rest of the crate works with:
//!
//! - [`RemoteObject`]: one named blob (`head`, `open`, `create`)
//! - [`Bucket`]: a namespace that hands out remote objects by name
//!
//! Implementations:
//! - `InMemoryObjectStore`: for unit tests and DST
//! - `LocalFsObjectStore`: for development and local testing
//! - `SimulatedObjectStore`: fault-injecting wrapper for DST
//! - `S3ObjectStore`: for production (feature-gated)

mod local_fs;
mod memory;
#[cfg(feature = "s3")]
mod s3;
mod simulated;

pub use local_fs::LocalFsObjectStore;
pub use memory::InMemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
pub use simulated::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};

use crate::error::{FeedError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, ErrorKind, Read, Result as IoResult, Write};
use std::sync::Arc;
use tracing::debug;

/// String metadata attached to an object at creation time.
///
/// Keys are stored lower-case; lookups through [`RemoteObject`] are
/// therefore case-insensitive.
pub type Metadata = BTreeMap<String, String>;

/// Metadata for a stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Creation timestamp (Unix ms)
    pub created_at_ms: u64,
    /// ETag or content hash (optional)
    pub etag: Option<String>,
    /// User metadata supplied when the object was created
    pub metadata: Metadata,
}

impl ObjectMeta {
    /// Case-insensitive metadata lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Result of a list operation
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// Objects matching the prefix
    pub objects: Vec<ObjectMeta>,
    /// Continuation token for pagination (if more results exist)
    pub continuation_token: Option<String>,
}

/// Object store abstraction trait
///
/// Absent keys are reported as `ErrorKind::NotFound`. `put` must be atomic:
/// readers observe either the previous object or the complete new one.
pub trait ObjectStore: Send + Sync + std::fmt::Debug + 'static {
    /// Create or overwrite an object together with its metadata
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
        metadata: &'a Metadata,
    ) -> BoxFuture<'a, IoResult<()>>;

    /// Get an object's contents
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Bytes>>;

    /// Get object metadata without downloading content
    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>>;

    /// Delete an object; deleting an absent object succeeds
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>>;

    /// List objects with a prefix, sorted by key
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>>;

    /// Check if an object exists
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>> {
        Box::pin(async move {
            match self.head(key).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Release connections held by the store
    fn close(&self) -> BoxFuture<'_, IoResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Lower-cases metadata keys before they reach a backend.
pub(crate) fn normalize_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

/// Handle to a single named blob.
///
/// Cloning is cheap and shares the underlying store.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl RemoteObject {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        RemoteObject {
            store,
            key: key.into(),
        }
    }

    /// Full key within the store.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last path segment of the key; used for codec detection.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Metadata of the object, or `None` when it does not exist.
    pub async fn head(&self) -> Result<Option<ObjectMeta>> {
        match self.store.head(&self.key).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a read stream over the object's current contents.
    pub async fn open(&self) -> Result<BlobReader> {
        match self.store.get(&self.key).await {
            Ok(data) => Ok(BlobReader {
                inner: Cursor::new(data),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FeedError::NotFound(self.key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Start a new version of the object. Nothing becomes visible until
    /// [`BlobWriter::commit`].
    pub fn create(&self, metadata: Metadata) -> BlobWriter {
        BlobWriter {
            remote: self.clone(),
            metadata: normalize_metadata(&metadata),
            buf: Vec::new(),
        }
    }

    /// Close the underlying store handle.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await.map_err(FeedError::from)
    }
}

/// Read stream over one object.
#[derive(Debug)]
pub struct BlobReader {
    inner: Cursor<Bytes>,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.inner.read(buf)
    }
}

/// Staged write to one object.
///
/// Data is buffered until `commit`, which hands it to the store in a single
/// atomic `put`. Dropping the writer, or calling `discard`, aborts it.
#[derive(Debug)]
pub struct BlobWriter {
    remote: RemoteObject,
    metadata: Metadata,
    buf: Vec<u8>,
}

impl BlobWriter {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Publish the staged bytes.
    pub async fn commit(self) -> Result<()> {
        let size = self.buf.len();
        self.remote
            .store
            .put(&self.remote.key, Bytes::from(self.buf), &self.metadata)
            .await?;
        debug!(key = %self.remote.key, size, "blob committed");
        Ok(())
    }

    /// Abort the write.
    pub fn discard(self) {
        debug!(key = %self.remote.key, staged = self.buf.len(), "blob discarded");
    }
}

impl Write for BlobWriter {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

/// Namespace of objects within a store.
#[derive(Debug, Clone)]
pub struct Bucket {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl Bucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Bucket {
            store,
            prefix: String::new(),
        }
    }

    /// Bucket rooted at `prefix` within the store.
    pub fn with_prefix(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Bucket { store, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Handle to the named object inside the bucket.
    pub fn object(&self, name: &str) -> RemoteObject {
        let key = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        };
        RemoteObject::new(self.store.clone(), key)
    }

    /// Names (relative to the bucket) of all objects starting with `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full = if self.prefix.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{}", self.prefix, prefix)
        };
        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.store.list(&full, token.as_deref()).await?;
            names.extend(
                page.objects
                    .into_iter()
                    .map(|o| o.key.strip_prefix(&strip).unwrap_or(&o.key).to_string()),
            );
            match page.continuation_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(names)
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await.map_err(FeedError::from)
    }
}
