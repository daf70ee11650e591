use super::{normalize_metadata, ListResult, Metadata, ObjectMeta, ObjectStore};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::io::{ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

/// Directory (under the base path) holding metadata sidecars.
const META_DIR: &str = ".feedsync-meta";
/// Directory (under the base path) holding in-flight writes.
const TMP_DIR: &str = ".feedsync-tmp";

/// Local filesystem object store for development and testing
///
/// Object contents live at `<base>/<key>`; metadata lives in a JSON sidecar
/// at `<base>/.feedsync-meta/<key>.json`. Puts stage into a temp file and
/// rename it into place, so readers never see a partial object.
#[derive(Debug)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
    tmp_seq: AtomicU64,
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.base_path.join(META_DIR).join(format!("{}.json", key))
    }

    fn tmp_path(&self) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::SeqCst);
        self.base_path
            .join(TMP_DIR)
            .join(format!("{}-{}", std::process::id(), seq))
    }

    async fn ensure_parent(path: &Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn read_metadata(&self, key: &str) -> IoResult<Metadata> {
        match tokio::fs::read(self.meta_path(key)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(e),
        }
    }

    fn created_at_ms(metadata: &std::fs::Metadata) -> u64 {
        metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn walk_dir(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<ObjectMeta>) -> IoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                let name = entry.file_name();
                if dir == base && (name == META_DIR || name == TMP_DIR) {
                    continue;
                }
                Self::walk_dir(&path, base, prefix, objects)?;
            } else if path.is_file() {
                let Ok(rel) = path.strip_prefix(base) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.starts_with(prefix) {
                    let metadata = std::fs::metadata(&path)?;
                    objects.push(ObjectMeta {
                        key,
                        size_bytes: metadata.len(),
                        created_at_ms: Self::created_at_ms(&metadata),
                        etag: None,
                        metadata: Metadata::new(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
        metadata: &'a Metadata,
    ) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let meta_path = self.meta_path(key);
            let tmp = self.tmp_path();
            Self::ensure_parent(&path).await?;
            Self::ensure_parent(&meta_path).await?;
            Self::ensure_parent(&tmp).await?;

            let sidecar = serde_json::to_vec(&normalize_metadata(metadata))
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
            tokio::fs::write(&meta_path, sidecar).await?;

            tokio::fs::write(&tmp, &data).await?;
            if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Bytes>> {
        Box::pin(async move {
            let data = tokio::fs::read(self.full_path(key)).await?;
            Ok(Bytes::from(data))
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(async move {
            let fs_meta = tokio::fs::metadata(self.full_path(key)).await?;
            if !fs_meta.is_file() {
                return Err(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("Key not found: {}", key),
                ));
            }
            Ok(ObjectMeta {
                key: key.to_string(),
                size_bytes: fs_meta.len(),
                created_at_ms: Self::created_at_ms(&fs_meta),
                etag: None,
                metadata: self.read_metadata(key).await?,
            })
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            for path in [self.full_path(key), self.meta_path(key)] {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        _continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(async move {
            if !self.base_path.exists() {
                return Ok(ListResult::default());
            }

            let mut objects = Vec::new();
            Self::walk_dir(&self.base_path, &self.base_path, prefix, &mut objects)?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));

            Ok(ListResult {
                objects,
                continuation_token: None,
            })
        })
    }
}
