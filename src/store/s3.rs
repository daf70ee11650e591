//! S3 Object Store Implementation
//!
//! Uses the `object_store` crate from the Arrow ecosystem. Supports AWS S3
//! and S3-compatible services (MinIO, LocalStack) via a custom endpoint.
//! Object metadata maps onto S3 user metadata (`x-amz-meta-*`).

use super::{normalize_metadata, ListResult, Metadata, ObjectMeta, ObjectStore};
use crate::config::S3Config;
use bytes::Bytes;
use futures::future::BoxFuture;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore as ObjectStoreTrait,
    PutOptions, PutPayload,
};
use std::borrow::Cow;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// S3 object store for production deployments
#[derive(Clone)]
pub struct S3ObjectStore {
    store: Arc<dyn ObjectStoreTrait>,
    prefix: String,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    ///
    /// Credentials come from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    pub fn new(config: &S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    /// Wrap an existing `object_store` implementation
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, prefix: impl Into<String>) -> Self {
        S3ObjectStore {
            store,
            prefix: prefix.into(),
        }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn strip_prefix(&self, path: &ObjectPath) -> String {
        let path_str = path.to_string();
        if self.prefix.is_empty() {
            return path_str;
        }
        let prefix_with_slash = format!("{}/", self.prefix);
        path_str
            .strip_prefix(&prefix_with_slash)
            .unwrap_or(&path_str)
            .to_string()
    }

    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }

    fn to_attributes(metadata: &Metadata) -> Attributes {
        let mut attributes = Attributes::new();
        for (k, v) in normalize_metadata(metadata) {
            attributes.insert(Attribute::Metadata(Cow::Owned(k)), AttributeValue::from(v));
        }
        attributes
    }

    fn from_attributes(attributes: &Attributes) -> Metadata {
        attributes
            .iter()
            .filter_map(|(attr, value)| match attr {
                Attribute::Metadata(k) => {
                    Some((k.to_ascii_lowercase(), AsRef::<str>::as_ref(value).to_string()))
                }
                _ => None,
            })
            .collect()
    }

    fn convert_meta(&self, meta: &object_store::ObjectMeta, metadata: Metadata) -> ObjectMeta {
        ObjectMeta {
            key: self.strip_prefix(&meta.location),
            size_bytes: meta.size as u64,
            created_at_ms: meta.last_modified.timestamp_millis().try_into().unwrap_or(0),
            etag: meta.e_tag.clone(),
            metadata,
        }
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Bytes,
        metadata: &'a Metadata,
    ) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let opts = PutOptions {
                attributes: Self::to_attributes(metadata),
                ..Default::default()
            };
            self.store
                .put_opts(&self.full_path(key), PutPayload::from(data), opts)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Bytes>> {
        Box::pin(async move {
            let result = self
                .store
                .get(&self.full_path(key))
                .await
                .map_err(Self::map_error)?;
            result.bytes().await.map_err(Self::map_error)
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(async move {
            let opts = GetOptions {
                head: true,
                ..Default::default()
            };
            let result = self
                .store
                .get_opts(&self.full_path(key), opts)
                .await
                .map_err(Self::map_error)?;
            let metadata = Self::from_attributes(&result.attributes);
            let mut meta = self.convert_meta(&result.meta, metadata);
            meta.key = key.to_string();
            Ok(meta)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            match self.store.delete(&self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(async move {
            use futures::TryStreamExt;

            // object_store lists by path segment; filter the key prefix ourselves
            let (dir, _) = prefix.rsplit_once('/').unwrap_or(("", prefix));
            let list_root = if dir.is_empty() && self.prefix.is_empty() {
                None
            } else if dir.is_empty() {
                Some(ObjectPath::from(self.prefix.as_str()))
            } else {
                Some(self.full_path(dir))
            };

            let offset: usize = continuation_token
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);

            let mut all: Vec<ObjectMeta> = self
                .store
                .list(list_root.as_ref())
                .map_ok(|meta| self.convert_meta(&meta, Metadata::new()))
                .try_collect::<Vec<_>>()
                .await
                .map_err(Self::map_error)?
                .into_iter()
                .filter(|m| m.key.starts_with(prefix))
                .collect();
            all.sort_by(|a, b| a.key.cmp(&b.key));

            const PAGE_SIZE: usize = 1000;
            let total = all.len();
            let objects: Vec<ObjectMeta> = all.into_iter().skip(offset).take(PAGE_SIZE).collect();
            let continuation_token = if offset + PAGE_SIZE < total {
                Some((offset + PAGE_SIZE).to_string())
            } else {
                None
            };

            Ok(ListResult {
                objects,
                continuation_token,
            })
        })
    }
}
