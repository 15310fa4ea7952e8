use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::detect::model::ModelConfig;
use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// A backend instance owned by one session or request.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Detector backend trait.
///
/// This is the opaque inference call of the pipeline: it may be slow and it
/// may fail. Callers never retry a failed call; the stream loop logs the
/// failure and moves on to the next frame.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations must treat the frame as read-only and must not keep
    /// references to its pixels past the call.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult>;

    /// Apply a new model configuration.
    fn configure(&mut self, _config: &ModelConfig) -> Result<()> {
        Ok(())
    }
}

/// Lock the backend, run it, and record detection time when the backend did not.
pub fn run_detector(backend: &SharedBackend, frame: &Frame) -> Result<DetectionResult> {
    let mut guard = backend
        .lock()
        .map_err(|_| anyhow!("detector backend lock poisoned"))?;
    let started = Instant::now();
    let mut result = guard.detect(frame)?;
    if result.processing_time.detection == 0.0 {
        result.processing_time.detection = started.elapsed().as_secs_f64();
    }
    Ok(result)
}
