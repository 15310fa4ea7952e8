//! Error types that cross component boundaries.
//!
//! Transient read failures never appear here: `StreamSource` absorbs them and
//! reports `ReadOutcome::NoFrame`. Exhaustion is `ReadOutcome::EndOfStream`,
//! not an error. Inference failures are logged by the session and skipped.

use thiserror::Error;

use crate::frame::Shape;

/// The source could not be reached when opening a connection.
#[derive(Error, Debug)]
#[error("failed to connect to {uri}: {source}")]
pub struct ConnectionError {
    /// Redacted source URI (no password).
    pub uri: String,
    #[source]
    pub source: anyhow::Error,
}

impl ConnectionError {
    pub fn new(uri: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            uri: uri.into(),
            source,
        }
    }
}

/// A frame buffer that does not match its declared shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shape {0} has a zero or overflowing dimension")]
    InvalidShape(Shape),

    #[error("channel order {order} needs {expected} channels, shape has {actual}")]
    ChannelMismatch {
        order: &'static str,
        expected: u8,
        actual: u8,
    },

    #[error("unsupported channel count {0} (expected 1..=4)")]
    UnsupportedChannels(u8),

    #[error("frame data is {actual} bytes, shape {shape} needs {expected}")]
    LengthMismatch {
        shape: Shape,
        expected: usize,
        actual: usize,
    },
}

/// A transport payload that cannot be turned back into a frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded payload is {actual} bytes, shape {shape} needs {expected}")]
    LengthMismatch {
        shape: Shape,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Session lifecycle failures.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session for camera {camera} cannot start from state {state}")]
    NotIdle { camera: String, state: &'static str },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
