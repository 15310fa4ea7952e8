//! camstream
//!
//! Pulls frames from network cameras (or video files, or still images), runs
//! a detector on a rate-limited subset of them, and serves the annotated
//! frames to browsers as an MJPEG stream.
//!
//! # Pipeline
//!
//! `StreamSource::next_frame()` -> `RateLimiter::admit(now)` -> detector
//! -> box overlay + JPEG -> `multipart/x-mixed-replace` part.
//!
//! Each viewer gets its own `StreamSession`, which owns its source. Sources
//! reconnect on read failures under a bounded budget and never sleep inline;
//! a pending reconnect shows up as `ReadOutcome::NoFrame`.
//!
//! # Module Structure
//!
//! - `frame`: owned pixel buffers, JPEG encoding and box overlay
//! - `codec`: base64 transport form of a frame
//! - `ingest`: sources, connectors and the reconnect policy
//! - `rate`: minimum-period admission gate
//! - `detect`: detector backends, registry and model configuration
//! - `session`: one viewer's read/infer/emit loop
//! - `api`: HTTP server
//! - `config`: file and environment configuration

pub mod api;
pub mod codec;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod rate;
pub mod session;

pub use codec::EncodedFrame;
pub use detect::{BackendRegistry, DetectionResult, DetectorBackend, ModelConfig};
pub use error::{ConnectionError, DecodeError, FrameError, SessionError};
pub use frame::{ChannelOrder, Frame, Shape};
pub use ingest::{
    prepare_source, PreparedSource, ReadOutcome, ReconnectPolicy, SourceKind, SourceUri,
    StreamSource,
};
pub use rate::RateLimiter;
pub use session::{Emission, SessionEnd, SessionHandle, SessionState, StreamSession};
