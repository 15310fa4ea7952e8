use serde::{Deserialize, Serialize};

/// Result of running detection on a frame.
///
/// Field names follow the JSON the dashboard consumes (`box`, `d_score`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub results: Vec<Detection>,
    pub processing_time: ProcessingTime,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(rename = "d_score")]
    pub score: f32,
    pub class_id: u32,
}

/// Pixel coordinates, inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: u32,
    pub ymin: u32,
    pub xmax: u32,
    pub ymax: u32,
}

/// Seconds spent per stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTime {
    pub detection: f64,
    pub recognition: f64,
}
