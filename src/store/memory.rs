use super::{normalize_metadata, ListResult, Metadata, ObjectMeta, ObjectStore};
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory object store for unit tests and deterministic simulation
///
/// Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, StoredObject>>>,
    puts: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    created_at_ms: u64,
    metadata: Metadata,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: self.data.len() as u64,
            created_at_ms: self.created_at_ms,
            etag: Some(format!("{:08x}", crc32fast::hash(&self.data))),
            metadata: self.metadata.clone(),
        }
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Number of successful puts since creation
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Clear all objects
    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn not_found(key: &str) -> IoError {
        IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key))
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
        metadata: &'a Metadata,
    ) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let obj = StoredObject {
                data,
                created_at_ms: Self::now_ms(),
                metadata: normalize_metadata(metadata),
            };
            self.data.write().insert(key.to_string(), obj);
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Bytes>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| Self::not_found(key))
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.meta(key))
                .ok_or_else(|| Self::not_found(key))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        _continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(async move {
            let data = self.data.read();
            let mut objects: Vec<ObjectMeta> = data
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| v.meta(k))
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));

            Ok(ListResult {
                objects,
                continuation_token: None,
            })
        })
    }
}
