//! Codec pipeline building blocks: compression wraps the byte stream, the
//! format turns records into bytes on top of it.

mod compression;
mod format;

pub use compression::{Compression, CompressWriter, DecompressReader};
pub use format::{Decoder, Encoder, Format, Record};

#[cfg(test)]
pub(crate) use format::tests::{seed, TestRecord};
