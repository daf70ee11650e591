//! Version negotiation between producers and consumers.
//!
//! Neither side talks to the other. Each one reads the version stored in the
//! remote object's metadata and compares it with its own using
//! [`should_skip`]; the producer passes `(local, remote)`, the consumer
//! `(remote, local)`.

use crate::clock::Timestamp;
use crate::error::Result;
use crate::store::{Metadata, ObjectMeta, RemoteObject};

/// Metadata key holding the feed version.
pub const META_VERSION: &str = "x-feedx-version";
/// Metadata key holding the last-modified time in milliseconds.
pub const META_LAST_MODIFIED: &str = "x-feedx-last-modified";
/// Last-modified key written by older pushers.
pub const META_PUSHER_LAST_MODIFIED: &str = "x-feedx-pusher-last-modified";

/// Decides whether a sync is unnecessary.
///
/// Version `0` means "unknown", so two zeros never skip. Otherwise the
/// candidate must be strictly newer than the reference to proceed.
pub fn should_skip(candidate: i64, reference: i64) -> bool {
    (candidate != 0 || reference != 0) && candidate <= reference
}

/// Version stored in object metadata. Objects written by older producers
/// carry no version key; their last-modified timestamp stands in for it.
/// Garbled values read as zero.
pub fn version_from_meta(meta: &ObjectMeta) -> i64 {
    if let Some(raw) = meta.get(META_VERSION) {
        return raw.trim().parse().unwrap_or(0);
    }
    last_modified_from_meta(meta).as_millis()
}

/// Last-modified timestamp stored in object metadata.
pub fn last_modified_from_meta(meta: &ObjectMeta) -> Timestamp {
    [META_LAST_MODIFIED, META_PUSHER_LAST_MODIFIED]
        .iter()
        .filter_map(|key| meta.get(key))
        .filter_map(Timestamp::parse)
        .find(|ts| !ts.is_zero())
        .unwrap_or_default()
}

/// Current version of a remote object; an absent object is version zero.
pub async fn fetch_remote_version(remote: &RemoteObject) -> Result<i64> {
    Ok(remote
        .head()
        .await?
        .map(|meta| version_from_meta(&meta))
        .unwrap_or(0))
}

/// Last-modified time of a remote object; zero when absent.
pub async fn fetch_last_modified(remote: &RemoteObject) -> Result<Timestamp> {
    Ok(remote
        .head()
        .await?
        .map(|meta| last_modified_from_meta(&meta))
        .unwrap_or_default())
}

/// Metadata written with every produced object.
pub fn version_metadata(version: i64, last_modified: Timestamp) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(META_VERSION.to_string(), version.to_string());
    meta.insert(META_LAST_MODIFIED.to_string(), last_modified.to_string());
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryObjectStore, ObjectStore};
    use std::sync::Arc;

    fn meta(pairs: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            metadata: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_skip_law() {
        assert!(!should_skip(0, 0), "bootstrap must sync");

        for (a, b) in [(0, 1), (1, 1), (5, 9), (101, 101), (-3, 0), (0, 7)] {
            assert!(should_skip(a, b), "{} <= {} must skip", a, b);
        }
        for (a, b) in [(1, 0), (102, 101), (9, 5), (0, -1)] {
            assert!(!should_skip(a, b), "{} > {} must not skip", a, b);
        }
    }

    #[test]
    fn test_equal_versions_always_skip() {
        for v in [1, 33, 101, i64::MAX] {
            assert!(should_skip(v, v));
        }
    }

    #[test]
    fn test_version_from_meta_fallbacks() {
        assert_eq!(version_from_meta(&meta(&[("x-feedx-version", "101")])), 101);
        assert_eq!(
            version_from_meta(&meta(&[("x-feedx-last-modified", "1515151515123")])),
            1_515_151_515_123
        );
        assert_eq!(
            version_from_meta(&meta(&[
                ("x-feedx-last-modified", "0"),
                ("x-feedx-pusher-last-modified", "1544477788899"),
            ])),
            1_544_477_788_899
        );
        assert_eq!(version_from_meta(&meta(&[("x-feedx-version", "junk")])), 0);
        assert_eq!(
            version_from_meta(&meta(&[
                ("x-feedx-version", "0"),
                ("x-feedx-last-modified", "1515151515123"),
            ])),
            0,
            "an explicit zero version is not replaced by the timestamp"
        );
        assert_eq!(version_from_meta(&meta(&[])), 0);
    }

    #[test]
    fn test_version_metadata_roundtrip() {
        let written = version_metadata(33, Timestamp(1_515_151_515_123));
        let m = ObjectMeta {
            metadata: written,
            ..Default::default()
        };
        assert_eq!(version_from_meta(&m), 33);
        assert_eq!(last_modified_from_meta(&m), Timestamp(1_515_151_515_123));
    }

    #[tokio::test]
    async fn test_fetch_remote_version_missing_is_zero() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let obj = RemoteObject::new(store, "file.json");

        assert_eq!(fetch_remote_version(&obj).await.unwrap(), 0);
        assert!(fetch_last_modified(&obj).await.unwrap().is_zero());

        obj.create(version_metadata(7, Timestamp(99)))
            .commit()
            .await
            .unwrap();
        assert_eq!(fetch_remote_version(&obj).await.unwrap(), 7);
        assert_eq!(fetch_last_modified(&obj).await.unwrap(), Timestamp(99));
    }
}
