//! Byte-level compression layer.
//!
//! Compression is chosen by tag or sniffed from an object name. Every codec
//! wraps a plain `Write`/`Read`, so the format layer above never knows which
//! one is in use.

use crate::error::FeedError;
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::str::FromStr;

/// zstd level used for feed objects
const ZSTD_LEVEL: i32 = 3;

/// Compression codec applied to feed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Pass-through
    #[default]
    None,
    Gzip,
    /// Raw deflate stream
    Flate,
    Zstd,
}

impl Compression {
    /// Sniff compression from an object name.
    ///
    /// An extension ending in `z` (`.gz`, `.jsonz`, `.pbz`) selects gzip;
    /// `.flate` and `.zst` select their codecs; anything else is pass-through.
    pub fn detect(name: &str) -> Self {
        let base = name.rsplit('/').next().unwrap_or(name);
        let Some((_, ext)) = base.rsplit_once('.') else {
            return Compression::None;
        };
        match ext {
            "flate" => Compression::Flate,
            "zst" => Compression::Zstd,
            ext if ext.ends_with('z') => Compression::Gzip,
            _ => Compression::None,
        }
    }

    /// Short tag, as used in config files.
    pub fn tag(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Flate => "flate",
            Compression::Zstd => "zstd",
        }
    }

    /// Suffix appended to generated object names.
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Flate => ".flate",
            Compression::Zstd => ".zst",
        }
    }

    pub fn new_writer<W: Write>(&self, w: W) -> io::Result<CompressWriter<W>> {
        Ok(match self {
            Compression::None => CompressWriter::None(w),
            Compression::Gzip => CompressWriter::Gzip(GzEncoder::new(w, flate2::Compression::default())),
            Compression::Flate => {
                CompressWriter::Flate(DeflateEncoder::new(w, flate2::Compression::default()))
            }
            Compression::Zstd => CompressWriter::Zstd(zstd::stream::write::Encoder::new(w, ZSTD_LEVEL)?),
        })
    }

    pub fn new_reader<R: Read>(&self, r: R) -> io::Result<DecompressReader<R>> {
        Ok(match self {
            Compression::None => DecompressReader::None(r),
            Compression::Gzip => DecompressReader::Gzip(MultiGzDecoder::new(r)),
            Compression::Flate => DecompressReader::Flate(DeflateDecoder::new(r)),
            Compression::Zstd => DecompressReader::Zstd(zstd::stream::read::Decoder::new(r)?),
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Compression {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "flate" | "deflate" => Ok(Compression::Flate),
            "zstd" | "zst" => Ok(Compression::Zstd),
            _ => Err(FeedError::UnknownCodec {
                kind: "compression",
                tag: s.to_string(),
            }),
        }
    }
}

/// Compressing writer.
pub enum CompressWriter<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Flate(DeflateEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressWriter<W> {
    /// Flush trailing compressed data and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::None(mut w) => {
                w.flush()?;
                Ok(w)
            }
            CompressWriter::Gzip(e) => e.finish(),
            CompressWriter::Flate(e) => e.finish(),
            CompressWriter::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::None(w) => w.write(buf),
            CompressWriter::Gzip(e) => e.write(buf),
            CompressWriter::Flate(e) => e.write(buf),
            CompressWriter::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::None(w) => w.flush(),
            CompressWriter::Gzip(e) => e.flush(),
            CompressWriter::Flate(e) => e.flush(),
            CompressWriter::Zstd(e) => e.flush(),
        }
    }
}

impl<W: Write> fmt::Debug for CompressWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CompressWriter::None(_) => "none",
            CompressWriter::Gzip(_) => "gzip",
            CompressWriter::Flate(_) => "flate",
            CompressWriter::Zstd(_) => "zstd",
        };
        f.debug_tuple("CompressWriter").field(&tag).finish()
    }
}

/// Decompressing reader.
pub enum DecompressReader<R: Read> {
    None(R),
    Gzip(MultiGzDecoder<R>),
    Flate(DeflateDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressReader::None(r) => r.read(buf),
            DecompressReader::Gzip(d) => d.read(buf),
            DecompressReader::Flate(d) => d.read(buf),
            DecompressReader::Zstd(d) => d.read(buf),
        }
    }
}

impl<R: Read> fmt::Debug for DecompressReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            DecompressReader::None(_) => "none",
            DecompressReader::Gzip(_) => "gzip",
            DecompressReader::Flate(_) => "flate",
            DecompressReader::Zstd(_) => "zstd",
        };
        f.debug_tuple("DecompressReader").field(&tag).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Compression; 4] = [
        Compression::None,
        Compression::Gzip,
        Compression::Flate,
        Compression::Zstd,
    ];

    #[test]
    fn test_detect() {
        assert_eq!(Compression::detect("/path/to/file.json"), Compression::None);
        assert_eq!(Compression::detect("/path/to/file.json.gz"), Compression::Gzip);
        assert_eq!(Compression::detect("/path/to/file.jsonz"), Compression::Gzip);
        assert_eq!(Compression::detect("/path/to/file.pbz"), Compression::Gzip);
        assert_eq!(Compression::detect("/path/to/file.pb.flate"), Compression::Flate);
        assert_eq!(Compression::detect("/path/to/file.pb.zst"), Compression::Zstd);
        assert_eq!(Compression::detect("/path/to/file"), Compression::None);
    }

    #[test]
    fn test_detect_ignores_directories() {
        assert_eq!(Compression::detect("a.b/quiz"), Compression::None);
        assert_eq!(Compression::detect("feeds.zst/items"), Compression::None);
        assert_eq!(Compression::detect("dir.gz/file.json"), Compression::None);
        assert_eq!(Compression::detect("dir.v1/file.gz"), Compression::Gzip);
    }

    #[test]
    fn test_tags_parse_back() {
        for c in ALL {
            assert_eq!(c.tag().parse::<Compression>().unwrap(), c);
        }
        assert!("lz4".parse::<Compression>().is_err());
    }

    #[test]
    fn test_suffix_is_detected_as_itself() {
        for c in ALL {
            assert_eq!(Compression::detect(&format!("data.json{}", c.suffix())), c);
        }
    }

    #[test]
    fn test_compress_decompress() {
        let payload = b"feed feed feed feed feed feed feed feed".repeat(20);

        for c in ALL {
            let mut w = c.new_writer(Vec::new()).unwrap();
            w.write_all(&payload).unwrap();
            let compressed = w.finish().unwrap();
            if c != Compression::None {
                assert!(compressed.len() < payload.len(), "{} should shrink input", c);
            }

            let mut out = Vec::new();
            c.new_reader(compressed.as_slice())
                .unwrap()
                .read_to_end(&mut out)
                .unwrap();
            assert_eq!(out, payload, "{} round trip", c);
        }
    }
}
