use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// Placeholder model: accepts every frame and reports nothing.
#[derive(Default)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionResult> {
        Ok(DetectionResult::default())
    }
}
