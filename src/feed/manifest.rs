//! Manifest for incremental feeds.
//!
//! An incremental feed is a bucket of append-only data files plus one
//! `manifest.json` listing them. Concatenating the listed files in order
//! reproduces the feed as of the manifest's version.
//!
//! ## Commit order
//!
//! 1. Write and commit the new data file
//! 2. Append its name and commit the manifest
//! 3. On failure between the two, the manifest still describes the previous
//!    version and the orphaned data file is never read

use crate::clock::Timestamp;
use crate::codec::{Compression, Format, Record};
use crate::error::{FeedError, Result};
use crate::feed::reader::{Reader, ReaderOptions};
use crate::feed::writer::{Writer, WriterOptions};
use crate::store::{Bucket, RemoteObject};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Object name of the manifest inside a feed bucket.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Format used for data files when the writer options leave it unset.
pub const DEFAULT_DATA_FORMAT: Format = Format::Json;
/// Compression used for data files when the writer options leave it unset.
pub const DEFAULT_DATA_COMPRESSION: Compression = Compression::Gzip;

/// Current state of an incremental feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Version of the newest data included in `files`
    pub version: i64,
    /// Counter reserved for compaction
    pub generation: i64,
    /// Data files, oldest first
    pub files: Vec<String>,
}

impl Record for Manifest {}

/// Loads a manifest. A missing manifest is an empty one.
pub async fn load_manifest(obj: &RemoteObject) -> Result<Manifest> {
    let mut reader = Reader::new(obj.clone(), &ReaderOptions::default().with_format(Format::Json));
    let loaded = match reader.decode::<Manifest>().await {
        Ok(found) => found.unwrap_or_default(),
        Err(e) if e.is_not_found() => Manifest::default(),
        Err(e) => return Err(e),
    };
    reader.close();
    Ok(loaded)
}

impl Manifest {
    /// Name of the data file holding `version` in the current generation.
    pub fn generate_file_name(&self, version: i64, format: Format, compression: Compression) -> String {
        format!(
            "data-{}-{}{}{}",
            self.generation,
            version,
            format.extension(),
            compression.suffix()
        )
    }

    /// Like [`generate_file_name`](Manifest::generate_file_name), but never
    /// returns a name the manifest already lists. Re-publishing an
    /// unversioned feed appends `-1`, `-2`, ... to the version.
    pub fn next_file_name(&self, version: i64, format: Format, compression: Compression) -> String {
        let mut name = self.generate_file_name(version, format, compression);
        let mut seq = 0u64;
        while self.files.contains(&name) {
            seq += 1;
            name = format!(
                "data-{}-{}-{}{}{}",
                self.generation,
                version,
                seq,
                format.extension(),
                compression.suffix()
            );
        }
        name
    }

    /// Writes the data for `opts.version` into a new file in `bucket`.
    ///
    /// On success the file is listed and the manifest advanced to
    /// `opts.version`; nothing changes on failure. A produce function that
    /// writes nothing adds no file but still advances the version. Returns
    /// the number of records written.
    pub async fn write_data_file<F>(&mut self, bucket: &Bucket, opts: &WriterOptions, pfn: F) -> Result<u64>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        let format = opts.format.unwrap_or(DEFAULT_DATA_FORMAT);
        let compression = opts.compression.unwrap_or(DEFAULT_DATA_COMPRESSION);
        let name = self.next_file_name(opts.version, format, compression);

        let wopts = WriterOptions {
            format: Some(format),
            compression: Some(compression),
            ..opts.clone()
        };
        let mut writer = Writer::new(bucket.object(&name), &wopts);
        if let Err(e) = pfn(&mut writer) {
            let _ = writer.discard();
            return Err(e);
        }
        let wrote_data = !writer.is_untouched();
        writer.commit().await?;

        if wrote_data {
            debug!(file = %name, records = writer.num_written(), "data file added");
            self.files.push(name);
        }
        self.version = opts.version;
        Ok(writer.num_written())
    }

    /// Publishes the manifest, tagged with its version.
    ///
    /// A manifest that fails [`verify_invariants`](Manifest::verify_invariants)
    /// is never written.
    pub async fn commit(&self, obj: &RemoteObject, last_modified: Timestamp) -> Result<()> {
        self.verify_invariants()?;
        let opts = WriterOptions::default()
            .with_format(Format::Json)
            .with_compression(Compression::None)
            .with_version(self.version)
            .with_last_modified(last_modified);
        let mut writer = Writer::new(obj.clone(), &opts);
        writer.encode(self)?;
        writer.commit().await
    }

    /// Handles to every data file, in replay order.
    pub fn remotes(&self, bucket: &Bucket) -> Vec<RemoteObject> {
        self.files.iter().map(|f| bucket.object(f)).collect()
    }

    /// Fails with `VersionConflict` unless `current` is still at `expected`.
    pub fn ensure_version(current: &Manifest, expected: i64) -> Result<()> {
        if current.version != expected {
            return Err(FeedError::VersionConflict {
                expected,
                actual: current.version,
            });
        }
        Ok(())
    }

    /// Verify all invariants hold
    ///
    /// # Invariants
    /// - File names are unique
    pub fn verify_invariants(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.files.iter().find(|f| !seen.insert(f.as_str())) {
            return Err(FeedError::InvalidManifest(format!("duplicate data file {}", dup)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{seed, TestRecord};
    use crate::feed::version::fetch_remote_version;
    use crate::store::{InMemoryObjectStore, ObjectStore};
    use std::sync::Arc;

    fn bucket() -> Bucket {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        Bucket::with_prefix(store, "feeds/items")
    }

    #[test]
    fn test_generate_file_name() {
        let m = Manifest {
            generation: 2,
            ..Default::default()
        };
        assert_eq!(
            m.generate_file_name(33, Format::Protobuf, Compression::Gzip),
            "data-2-33.pb.gz"
        );
        assert_eq!(m.generate_file_name(7, Format::Json, Compression::None), "data-2-7.json");
    }

    #[test]
    fn test_json_layout() {
        let m = Manifest {
            version: 33,
            generation: 0,
            files: vec!["data-0-33.json.gz".into()],
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"version": 33, "generation": 0, "files": ["data-0-33.json.gz"]})
        );
    }

    #[tokio::test]
    async fn test_load_missing_is_default() {
        let bucket = bucket();
        let m = load_manifest(&bucket.object(MANIFEST_NAME)).await.unwrap();
        assert_eq!(m, Manifest::default());
    }

    #[tokio::test]
    async fn test_write_then_commit() {
        let bucket = bucket();
        let obj = bucket.object(MANIFEST_NAME);
        let mut m = load_manifest(&obj).await.unwrap();

        let opts = WriterOptions::default().with_version(33);
        let n = m
            .write_data_file(&bucket, &opts, |w| {
                w.encode(&seed(1))?;
                w.encode(&seed(2))
            })
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(m.files, vec!["data-0-33.json.gz"]);

        assert!(obj.head().await.unwrap().is_none(), "manifest not yet committed");
        m.commit(&obj, Timestamp(5)).await.unwrap();

        assert_eq!(fetch_remote_version(&obj).await.unwrap(), 33);
        assert_eq!(load_manifest(&obj).await.unwrap(), m);
    }

    #[tokio::test]
    async fn test_append_only_replay() {
        let bucket = bucket();
        let obj = bucket.object(MANIFEST_NAME);

        for (version, ids) in [(1, 0..2), (2, 2..5)] {
            let mut m = load_manifest(&obj).await.unwrap();
            let opts = WriterOptions::default().with_version(version);
            m.write_data_file(&bucket, &opts, |w| {
                for i in ids {
                    w.encode(&seed(i))?;
                }
                Ok(())
            })
            .await
            .unwrap();
            m.commit(&obj, Timestamp(version)).await.unwrap();
        }

        let m = load_manifest(&obj).await.unwrap();
        assert_eq!(m.version, 2);
        assert_eq!(m.files, vec!["data-0-1.json.gz", "data-0-2.json.gz"]);

        let mut r = Reader::multi(m.remotes(&bucket), &ReaderOptions::default());
        let mut got = Vec::new();
        while let Some(rec) = r.decode::<TestRecord>().await.unwrap() {
            got.push(rec);
        }
        assert_eq!(got, (0..5).map(seed).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_replay_follows_list_not_name_order() {
        let bucket = bucket();
        let mut m = Manifest::default();
        for version in [9, 10] {
            let opts = WriterOptions::default().with_version(version);
            m.write_data_file(&bucket, &opts, |w| w.encode(&seed(version)))
                .await
                .unwrap();
        }
        // "data-0-10" sorts before "data-0-9".
        assert_eq!(m.files, vec!["data-0-9.json.gz", "data-0-10.json.gz"]);

        let mut r = Reader::multi(m.remotes(&bucket), &ReaderOptions::default());
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), Some(seed(9)));
        assert_eq!(r.decode::<TestRecord>().await.unwrap(), Some(seed(10)));
    }

    #[tokio::test]
    async fn test_failed_produce_leaves_manifest_untouched() {
        let bucket = bucket();
        let mut m = Manifest::default();
        let opts = WriterOptions::default().with_version(9);

        let err = m
            .write_data_file(&bucket, &opts, |w| {
                w.encode(&seed(1))?;
                Err(FeedError::callback("source unavailable"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Callback(_)));
        assert_eq!(m, Manifest::default());
        assert!(bucket.list("data-").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_delta_adds_no_file() {
        let bucket = bucket();
        let mut m = Manifest::default();
        let opts = WriterOptions::default().with_version(4);

        let n = m.write_data_file(&bucket, &opts, |_| Ok(())).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(m.version, 4);
        assert!(m.files.is_empty());
    }

    #[tokio::test]
    async fn test_unversioned_republish_keeps_every_file() {
        let bucket = bucket();
        let obj = bucket.object(MANIFEST_NAME);

        for id in 1..=3 {
            let mut m = load_manifest(&obj).await.unwrap();
            m.write_data_file(&bucket, &WriterOptions::default(), |w| w.encode(&seed(id)))
                .await
                .unwrap();
            m.commit(&obj, Timestamp(id)).await.unwrap();
        }

        let m = load_manifest(&obj).await.unwrap();
        assert_eq!(
            m.files,
            vec!["data-0-0.json.gz", "data-0-0-1.json.gz", "data-0-0-2.json.gz"]
        );

        let mut r = Reader::multi(m.remotes(&bucket), &ReaderOptions::default());
        let mut got = Vec::new();
        while let Some(rec) = r.decode::<TestRecord>().await.unwrap() {
            got.push(rec);
        }
        assert_eq!(got, vec![seed(1), seed(2), seed(3)]);
    }

    #[tokio::test]
    async fn test_duplicate_files_are_rejected_on_commit() {
        let bucket = bucket();
        let obj = bucket.object(MANIFEST_NAME);
        let m = Manifest {
            version: 2,
            generation: 0,
            files: vec!["data-0-1.json.gz".into(), "data-0-1.json.gz".into()],
        };

        assert!(matches!(m.verify_invariants(), Err(FeedError::InvalidManifest(_))));
        assert!(matches!(
            m.commit(&obj, Timestamp(1)).await,
            Err(FeedError::InvalidManifest(_))
        ));
        assert!(obj.head().await.unwrap().is_none());
    }

    #[test]
    fn test_ensure_version() {
        let m = Manifest {
            version: 3,
            ..Default::default()
        };
        Manifest::ensure_version(&m, 3).unwrap();
        assert!(matches!(
            Manifest::ensure_version(&m, 2),
            Err(FeedError::VersionConflict {
                expected: 2,
                actual: 3
            })
        ));
    }
}
