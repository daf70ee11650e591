//! Feed reader over one or more remote objects.

use crate::clock::Timestamp;
use crate::codec::{Compression, DecompressReader, Decoder, Format, Record};
use crate::error::{FeedError, Result};
use crate::feed::version::fetch_last_modified;
use crate::store::{BlobReader, RemoteObject};
use std::io::{BufReader, Read};
use tracing::debug;

/// Options for a [`Reader`]. Unset codecs are detected per object name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderOptions {
    pub format: Option<Format>,
    pub compression: Option<Compression>,
}

impl ReaderOptions {
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn resolve(&self, name: &str) -> (Format, Compression) {
        (
            self.format.unwrap_or_else(|| Format::detect(name)),
            self.compression.unwrap_or_else(|| Compression::detect(name)),
        )
    }
}

type Stream = Decoder<BufReader<DecompressReader<BlobReader>>>;

async fn open_stream(remote: &RemoteObject, opts: &ReaderOptions) -> Result<Stream> {
    let (format, compression) = opts.resolve(remote.name());
    let blob = remote.open().await?;
    let decompressed = compression.new_reader(blob)?;
    debug!(key = remote.key(), %format, %compression, "reader opened");
    Ok(format.decoder(BufReader::new(decompressed)))
}

/// Reads records from a sequence of remote objects as if they were one.
///
/// Objects are opened lazily, in order, and each is released as soon as it
/// is exhausted.
#[derive(Debug)]
pub struct Reader {
    remotes: Vec<RemoteObject>,
    opts: ReaderOptions,
    cursor: usize,
    current: Option<Stream>,
    num_read: u64,
    closed: bool,
}

impl Reader {
    pub fn new(remote: RemoteObject, opts: &ReaderOptions) -> Self {
        Self::multi(vec![remote], opts)
    }

    /// Reader that concatenates `remotes` in order.
    pub fn multi(remotes: Vec<RemoteObject>, opts: &ReaderOptions) -> Self {
        Reader {
            remotes,
            opts: opts.clone(),
            cursor: 0,
            current: None,
            num_read: 0,
            closed: false,
        }
    }

    pub fn remotes(&self) -> &[RemoteObject] {
        &self.remotes
    }

    /// Records successfully decoded so far.
    pub fn num_read(&self) -> u64 {
        self.num_read
    }

    /// Opens the current object if needed; `None` once all are consumed.
    async fn current_stream(&mut self) -> Result<Option<&mut Stream>> {
        if self.closed {
            return Err(FeedError::ReaderClosed);
        }
        if self.current.is_none() {
            let Some(remote) = self.remotes.get(self.cursor) else {
                return Ok(None);
            };
            self.current = Some(open_stream(remote, &self.opts).await?);
        }
        Ok(self.current.as_mut())
    }

    fn advance(&mut self) {
        self.current = None;
        self.cursor += 1;
    }

    /// Opens the first pending object so open errors surface early.
    pub(crate) async fn prefetch(&mut self) -> Result<()> {
        self.current_stream().await.map(|_| ())
    }

    /// Decodes the next record; `None` after the last object is exhausted.
    pub async fn decode<T: Record>(&mut self) -> Result<Option<T>> {
        loop {
            let Some(stream) = self.current_stream().await? else {
                return Ok(None);
            };
            match stream.decode::<T>()? {
                Some(record) => {
                    self.num_read += 1;
                    return Ok(Some(record));
                }
                None => self.advance(),
            }
        }
    }

    /// Reads raw decompressed bytes, crossing object boundaries
    /// transparently. Returns `0` at the end of the last object.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let Some(stream) = self.current_stream().await? else {
                return Ok(0);
            };
            match stream.get_mut().read(buf)? {
                0 => self.advance(),
                n => return Ok(n),
            }
        }
    }

    /// Reads all remaining raw bytes into `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let start = out.len();
        loop {
            let Some(stream) = self.current_stream().await? else {
                return Ok(out.len() - start);
            };
            stream.get_mut().read_to_end(out)?;
            self.advance();
        }
    }

    /// Newest last-modified time across all objects.
    pub async fn last_modified(&self) -> Result<Timestamp> {
        let mut newest = Timestamp::ZERO;
        for remote in &self.remotes {
            newest = newest.max(fetch_last_modified(remote).await?);
        }
        Ok(newest)
    }

    /// Releases any open object. Further reads fail.
    pub fn close(&mut self) {
        self.current = None;
        self.cursor = self.remotes.len();
        self.closed = true;
    }
}

/// Steps through remote objects one [`Reader`] at a time.
///
/// Each call to [`next`](ReaderIter::next) closes the previous reader before
/// opening the following one. After an error the iterator stays exhausted
/// and the error is available from [`err`](ReaderIter::err).
#[derive(Debug)]
pub struct ReaderIter {
    remotes: Vec<RemoteObject>,
    opts: ReaderOptions,
    cursor: usize,
    current: Option<Reader>,
    finished_reads: u64,
    err: Option<FeedError>,
}

impl ReaderIter {
    pub fn new(remotes: Vec<RemoteObject>, opts: &ReaderOptions) -> Self {
        ReaderIter {
            remotes,
            opts: opts.clone(),
            cursor: 0,
            current: None,
            finished_reads: 0,
            err: None,
        }
    }

    fn release_current(&mut self) {
        if let Some(mut reader) = self.current.take() {
            self.finished_reads += reader.num_read();
            reader.close();
        }
    }

    /// Advances to the next object. `None` means there is nothing more to
    /// read, either because all objects were visited or because opening one
    /// failed.
    pub async fn next(&mut self) -> Option<&mut Reader> {
        self.release_current();
        if self.err.is_some() {
            return None;
        }
        let remote = self.remotes.get(self.cursor)?.clone();
        self.cursor += 1;

        let mut reader = Reader::new(remote, &self.opts);
        if let Err(e) = reader.prefetch().await {
            self.err = Some(e);
            return None;
        }
        self.current = Some(reader);
        self.current.as_mut()
    }

    /// First error hit while opening an object.
    pub fn err(&self) -> Option<&FeedError> {
        self.err.as_ref()
    }

    /// Records read across every visited reader.
    pub fn num_read(&self) -> u64 {
        self.finished_reads + self.current.as_ref().map_or(0, Reader::num_read)
    }

    pub fn close(&mut self) {
        self.release_current();
        self.cursor = self.remotes.len();
    }
}
