//! Frame ingestion sources.
//!
//! This module provides:
//! - `StreamSource`: a pull-based frame source with bounded, scheduled reconnection
//! - Connectors that open the underlying transport:
//!   - `stub://` synthetic frames (always available, used by tests and demos)
//!   - `rtsp://`, `rtsps://`, `file://` through GStreamer (feature: rtsp-gstreamer)
//! - `SourceKind`: the single dispatch point from a user's source selection
//!   (image, video, camera) to something that produces frames
//!
//! Connections only report failures; deciding whether to reconnect, and when,
//! belongs to `StreamSource`.

#[cfg(feature = "rtsp-gstreamer")]
mod gst;
pub mod source;
mod synthetic;
pub mod uri;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use crate::frame::Frame;

#[cfg(feature = "rtsp-gstreamer")]
pub use gst::GstreamerConnector;
pub use source::{ReadOutcome, ReconnectPolicy, SourceHandle, SourceStats, StreamSource};
pub use synthetic::SyntheticConnector;
pub use uri::{CameraSettings, SourceUri};

/// An open transport to a video source.
pub trait Connection: Send {
    /// Read the next frame.
    ///
    /// An error means this connection is no longer usable; the owner
    /// releases it and decides whether to open another.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release transport resources. Called at most once.
    fn release(&mut self) {}
}

/// Opens connections to a source URI.
pub trait Connector: Send {
    fn connect(&mut self, uri: &SourceUri) -> Result<Box<dyn Connection>>;
}

/// Pick the connector for a URI scheme.
pub fn connector_for(uri: &SourceUri) -> Result<Box<dyn Connector>> {
    match uri.scheme() {
        "stub" => Ok(Box::new(SyntheticConnector::new())),
        "rtsp" | "rtsps" | "file" => {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Box::new(GstreamerConnector::new()?))
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                Err(anyhow!(
                    "{} sources require the rtsp-gstreamer feature",
                    uri.scheme()
                ))
            }
        }
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected stub, rtsp, rtsps or file",
            other
        )),
    }
}

/// What the user asked to run inference on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Image(PathBuf),
    Video(PathBuf),
    Stream(String),
}

/// A source ready for use: a single still frame, or a live source that still
/// has to be opened by its session.
pub enum PreparedSource {
    Still(Frame),
    Live(StreamSource),
}

/// Resolve a source selection.
///
/// Videos never reconnect: reaching the end of the file is the end of the
/// stream. Cameras use `policy`.
pub fn prepare_source(
    kind: &SourceKind,
    cameras: &HashMap<String, CameraSettings>,
    policy: ReconnectPolicy,
) -> Result<PreparedSource> {
    match kind {
        SourceKind::Image(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("read image {}", path.display()))?;
            Ok(PreparedSource::Still(Frame::from_image_bytes(&bytes)?))
        }
        SourceKind::Video(path) => {
            let uri = SourceUri::from_file_path(path)?;
            let connector = connector_for(&uri)?;
            Ok(PreparedSource::Live(StreamSource::new(
                uri,
                connector,
                ReconnectPolicy::disabled(),
            )))
        }
        SourceKind::Stream(camera_id) => {
            let settings = cameras
                .get(camera_id)
                .ok_or_else(|| anyhow!("unknown camera '{}'", camera_id))?;
            let uri = settings
                .source_uri()
                .with_context(|| format!("camera '{}'", camera_id))?;
            let connector = connector_for(&uri)?;
            Ok(PreparedSource::Live(StreamSource::new(uri, connector, policy)))
        }
    }
}
