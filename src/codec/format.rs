//! Record-level format layer.
//!
//! A [`Format`] turns records into bytes and back. Formats are stateless
//! between records, so one encoder or decoder can run across any number of
//! records in a stream:
//!
//! - JSON: one value per line (any whitespace-separated values decode)
//! - CBOR: concatenated CBOR items
//! - Protobuf: messages prefixed with their varint-encoded length

use crate::error::{FeedError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::str::FromStr;

/// Longest varint accepted as a protobuf length prefix.
const MAX_VARINT_LEN: usize = 10;

/// Largest protobuf message the decoder will buffer.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// A value that can be written to and read from a feed.
///
/// JSON and CBOR go through serde. Protobuf support is opt-in; types
/// generated by `prost` get it with [`protobuf_record!`](crate::protobuf_record).
pub trait Record: Serialize + DeserializeOwned + Send {
    /// Appends the protobuf encoding of `self` to `buf`.
    fn encode_protobuf(&self, _buf: &mut Vec<u8>) -> Result<()> {
        Err(FeedError::UnsupportedFormat("protobuf"))
    }

    /// Decodes one protobuf message.
    fn decode_protobuf(_buf: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        Err(FeedError::UnsupportedFormat("protobuf"))
    }
}

impl Record for serde_json::Value {}

/// Implements [`Record`] with protobuf support for `prost` messages.
///
/// The types must also derive serde's `Serialize` and `Deserialize`.
#[macro_export]
macro_rules! protobuf_record {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Record for $ty {
                fn encode_protobuf(&self, buf: &mut ::std::vec::Vec<u8>) -> $crate::Result<()> {
                    $crate::__private::prost::Message::encode(self, buf).map_err(::core::convert::Into::into)
                }

                fn decode_protobuf(buf: &[u8]) -> $crate::Result<Self> {
                    <$ty as $crate::__private::prost::Message>::decode(buf).map_err(::core::convert::Into::into)
                }
            }
        )+
    };
}

/// Serialization format of feed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// No format: raw byte access only, record encode/decode fails
    #[default]
    None,
    Json,
    Protobuf,
    Cbor,
}

impl Format {
    /// Sniff the format from an object name.
    ///
    /// Known extensions are `.json`/`.ndjson`, `.pb`/`.proto`/`.protobuf`
    /// and `.cbor`. An unknown extension ending in `z` is retried without
    /// the `z` (`.jsonz`); any other unknown extension is stripped and the
    /// next one examined (`.json.gz`).
    pub fn detect(name: &str) -> Self {
        let mut name = name.rsplit('/').next().unwrap_or(name);
        loop {
            let Some((base, ext)) = name.rsplit_once('.') else {
                return Format::None;
            };
            match ext {
                "json" | "ndjson" => return Format::Json,
                "pb" | "proto" | "protobuf" => return Format::Protobuf,
                "cbor" => return Format::Cbor,
                _ if ext.len() > 1 && ext.ends_with('z') => name = &name[..name.len() - 1],
                _ => name = base,
            }
        }
    }

    /// Short tag, as used in config files.
    pub fn tag(&self) -> &'static str {
        match self {
            Format::None => "none",
            Format::Json => "json",
            Format::Protobuf => "protobuf",
            Format::Cbor => "cbor",
        }
    }

    /// Extension used for generated object names.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::None => "",
            Format::Json => ".json",
            Format::Protobuf => ".pb",
            Format::Cbor => ".cbor",
        }
    }

    pub fn encoder<W: Write>(&self, w: W) -> Encoder<W> {
        Encoder {
            format: *self,
            inner: w,
            scratch: Vec::new(),
        }
    }

    pub fn decoder<R: BufRead>(&self, r: R) -> Decoder<R> {
        Decoder {
            format: *self,
            inner: r,
            scratch: Vec::new(),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Format {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Format::None),
            "json" | "ndjson" => Ok(Format::Json),
            "protobuf" | "proto" | "pb" => Ok(Format::Protobuf),
            "cbor" => Ok(Format::Cbor),
            _ => Err(FeedError::UnknownCodec {
                kind: "format",
                tag: s.to_string(),
            }),
        }
    }
}

/// Record encoder over a byte sink.
#[derive(Debug)]
pub struct Encoder<W: Write> {
    format: Format,
    inner: W,
    scratch: Vec<u8>,
}

impl<W: Write> Encoder<W> {
    pub fn format(&self) -> Format {
        self.format
    }

    /// Encodes one record.
    pub fn encode<T: Record>(&mut self, record: &T) -> Result<()> {
        match self.format {
            Format::None => Err(FeedError::NoFormat),
            Format::Json => {
                serde_json::to_writer(&mut self.inner, record)?;
                self.inner.write_all(b"\n")?;
                Ok(())
            }
            Format::Cbor => {
                ciborium::into_writer(record, &mut self.inner)?;
                Ok(())
            }
            Format::Protobuf => {
                self.scratch.clear();
                record.encode_protobuf(&mut self.scratch)?;
                let mut prefix = Vec::with_capacity(MAX_VARINT_LEN);
                prost::encoding::encode_varint(self.scratch.len() as u64, &mut prefix);
                self.inner.write_all(&prefix)?;
                self.inner.write_all(&self.scratch)?;
                Ok(())
            }
        }
    }

    /// Raw access to the underlying sink.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Flushes pending framing and returns the sink. The sink is returned
    /// even when the flush fails so outer layers can still be unwound.
    pub fn finish(mut self) -> (W, io::Result<()>) {
        let res = self.inner.flush();
        (self.inner, res)
    }
}

/// Record decoder over a buffered byte source.
#[derive(Debug)]
pub struct Decoder<R: BufRead> {
    format: Format,
    inner: R,
    scratch: Vec<u8>,
}

impl<R: BufRead> Decoder<R> {
    pub fn format(&self) -> Format {
        self.format
    }

    /// Decodes the next record, or `None` at end of stream.
    pub fn decode<T: Record>(&mut self) -> Result<Option<T>> {
        match self.format {
            Format::None => Err(FeedError::NoFormat),
            Format::Json => {
                let mut stream = serde_json::Deserializer::from_reader(&mut self.inner).into_iter::<T>();
                match stream.next() {
                    None => Ok(None),
                    Some(res) => Ok(Some(res?)),
                }
            }
            Format::Cbor => {
                if self.inner.fill_buf()?.is_empty() {
                    return Ok(None);
                }
                Ok(Some(ciborium::from_reader(&mut self.inner)?))
            }
            Format::Protobuf => {
                let Some(len) = self.read_length_prefix()? else {
                    return Ok(None);
                };
                if len > MAX_MESSAGE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("message length {} exceeds {}", len, MAX_MESSAGE_LEN),
                    )
                    .into());
                }
                // Grow with the data actually present, not with the prefix.
                self.scratch.clear();
                let n = (&mut self.inner).take(len as u64).read_to_end(&mut self.scratch)?;
                if n < len {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated message").into());
                }
                Ok(Some(T::decode_protobuf(&self.scratch)?))
            }
        }
    }

    /// Reads a varint length prefix; `None` on clean end of stream.
    fn read_length_prefix(&mut self) -> Result<Option<usize>> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = match self.inner.fill_buf()?.first() {
                Some(b) => *b,
                None if i == 0 => return Ok(None),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated length prefix",
                    )
                    .into())
                }
            };
            self.inner.consume(1);
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return usize::try_from(value).map(Some).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "length prefix overflow").into()
                });
            }
        }
        Err(io::Error::new(io::ErrorKind::InvalidData, "length prefix too long").into())
    }

    /// Raw access to the underlying source.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
