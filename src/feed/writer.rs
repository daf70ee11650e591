//! Feed writer: format encoder over compressor over a staged blob.

use crate::clock::{Clock, ProductionClock, Timestamp};
use crate::codec::{CompressWriter, Compression, Encoder, Format, Record};
use crate::error::{FeedError, Result};
use crate::feed::version::version_metadata;
use crate::store::{BlobWriter, RemoteObject};
use std::io::Write;
use tracing::{debug, info};

/// Options for a [`Writer`].
///
/// Unset format and compression are detected from the object name; an
/// unset last-modified time defaults to now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterOptions {
    pub format: Option<Format>,
    pub compression: Option<Compression>,
    /// Version tag stored in the object's metadata
    pub version: i64,
    /// Last-modified tag stored in the object's metadata
    pub last_modified: Option<Timestamp>,
}

impl WriterOptions {
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn with_last_modified(mut self, ts: Timestamp) -> Self {
        self.last_modified = Some(ts);
        self
    }

    /// Format and compression for an object name.
    pub fn resolve(&self, name: &str) -> (Format, Compression) {
        (
            self.format.unwrap_or_else(|| Format::detect(name)),
            self.compression.unwrap_or_else(|| Compression::detect(name)),
        )
    }
}

type Layers = Encoder<CompressWriter<BlobWriter>>;

#[derive(Debug)]
enum Stage {
    /// Nothing written yet; no blob exists
    Pending,
    Open(Layers),
    Committed,
    Discarded,
}

/// Encodes records into one remote object.
///
/// Layers are created on first write. Nothing is visible to readers until
/// [`commit`](Writer::commit); a writer that never received data commits
/// nothing at all. Dropping an uncommitted writer discards it.
#[derive(Debug)]
pub struct Writer {
    remote: RemoteObject,
    format: Format,
    compression: Compression,
    version: i64,
    last_modified: Timestamp,
    stage: Stage,
    num_written: u64,
}

impl Writer {
    pub fn new(remote: RemoteObject, opts: &WriterOptions) -> Self {
        Self::with_clock(remote, opts, &ProductionClock)
    }

    /// Like `new`, taking the default last-modified time from `clock`.
    pub fn with_clock(remote: RemoteObject, opts: &WriterOptions, clock: &dyn Clock) -> Self {
        let (format, compression) = opts.resolve(remote.name());
        Writer {
            remote,
            format,
            compression,
            version: opts.version,
            last_modified: opts.last_modified.unwrap_or_else(|| clock.now()),
            stage: Stage::Pending,
            num_written: 0,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    /// Records successfully encoded so far.
    pub fn num_written(&self) -> u64 {
        self.num_written
    }

    /// True while nothing has been written; such a writer commits nothing.
    pub fn is_untouched(&self) -> bool {
        matches!(self.stage, Stage::Pending)
    }

    fn layers(&mut self) -> Result<&mut Layers> {
        if let Stage::Pending = self.stage {
            let blob = self
                .remote
                .create(version_metadata(self.version, self.last_modified));
            let compressed = self.compression.new_writer(blob)?;
            debug!(
                key = self.remote.key(),
                format = %self.format,
                compression = %self.compression,
                "writer opened"
            );
            self.stage = Stage::Open(self.format.encoder(compressed));
        }
        match &mut self.stage {
            Stage::Open(layers) => Ok(layers),
            _ => Err(FeedError::WriterClosed),
        }
    }

    /// Appends one record.
    pub fn encode<T: Record>(&mut self, record: &T) -> Result<()> {
        self.layers()?.encode(record)?;
        self.num_written += 1;
        Ok(())
    }

    /// Appends raw bytes, bypassing the format.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.layers()?.get_mut().write_all(data)?;
        Ok(data.len())
    }

    pub fn write_str(&mut self, s: &str) -> Result<usize> {
        self.write(s.as_bytes())
    }

    /// Closes the encoder and the compressor, returning the blob if both
    /// closed cleanly. On failure the blob is dropped unpublished.
    fn unwind(layers: Layers) -> Result<BlobWriter> {
        let (compressed, encoder_res) = layers.finish();
        let blob_res = compressed.finish();
        match (encoder_res, blob_res) {
            (Ok(()), Ok(blob)) => Ok(blob),
            (Err(e), Ok(blob)) => {
                blob.discard();
                Err(e.into())
            }
            (Err(e), Err(_)) | (Ok(()), Err(e)) => Err(e.into()),
        }
    }

    /// Flushes every layer and publishes the object.
    ///
    /// Committing twice is a no-op; committing after a discard fails with
    /// [`FeedError::WriterClosed`].
    pub async fn commit(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.stage, Stage::Discarded) {
            Stage::Pending | Stage::Committed => {
                self.stage = Stage::Committed;
                Ok(())
            }
            Stage::Discarded => Err(FeedError::WriterClosed),
            Stage::Open(layers) => {
                let blob = Self::unwind(layers)?;
                let size = blob.len();
                blob.commit().await?;
                self.stage = Stage::Committed;
                info!(
                    key = self.remote.key(),
                    version = self.version,
                    records = self.num_written,
                    size,
                    "feed object committed"
                );
                Ok(())
            }
        }
    }

    /// Aborts the write. Safe to call repeatedly and after a commit.
    pub fn discard(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.stage, Stage::Discarded) {
            Stage::Committed => {
                self.stage = Stage::Committed;
                Ok(())
            }
            Stage::Pending | Stage::Discarded => Ok(()),
            Stage::Open(layers) => {
                Self::unwind(layers)?.discard();
                Ok(())
            }
        }
    }
}
