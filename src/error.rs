//! Error types for feed synchronization.
//!
//! Object store backends speak `std::io::Result` (absent keys surface as
//! `ErrorKind::NotFound`); everything above the store layer returns
//! [`FeedError`].

use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

/// Boxed error returned by caller-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = FeedError> = std::result::Result<T, E>;

/// Errors produced while publishing or consuming a feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Object store or stream I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR encode/decode failure.
    #[error("CBOR error: {0}")]
    Cbor(String),

    /// Protobuf encode failure.
    #[error("protobuf encode error: {0}")]
    ProtobufEncode(#[from] prost::EncodeError),

    /// Protobuf decode failure.
    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    /// Record encode/decode attempted without a format.
    #[error("no format configured")]
    NoFormat,

    /// The record type does not support the selected format.
    #[error("record type does not support the {0} format")]
    UnsupportedFormat(&'static str),

    /// A format or compression tag could not be parsed.
    #[error("unknown {kind} tag: {tag}")]
    UnknownCodec { kind: &'static str, tag: String },

    /// Writer was already committed or discarded.
    #[error("writer is closed")]
    WriterClosed,

    /// Reader was already closed.
    #[error("reader is closed")]
    ReaderClosed,

    /// Manifest advanced between load and commit.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    /// Manifest breaks a structural invariant.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Tracing subscriber could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Error returned from a produce/consume callback.
    #[error("callback failed: {0}")]
    Callback(BoxError),
}

impl FeedError {
    /// Wrap an arbitrary callback error.
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        FeedError::Callback(err.into())
    }

    /// True when the error means the object is absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            FeedError::NotFound(_) => true,
            FeedError::Io(e) => e.kind() == ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<ciborium::ser::Error<IoError>> for FeedError {
    fn from(e: ciborium::ser::Error<IoError>) -> Self {
        match e {
            ciborium::ser::Error::Io(e) => FeedError::Io(e),
            ciborium::ser::Error::Value(msg) => FeedError::Cbor(msg),
        }
    }
}

impl From<ciborium::de::Error<IoError>> for FeedError {
    fn from(e: ciborium::de::Error<IoError>) -> Self {
        match e {
            ciborium::de::Error::Io(e) => FeedError::Io(e),
            other => FeedError::Cbor(other.to_string()),
        }
    }
}
