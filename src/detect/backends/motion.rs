use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::model::ModelConfig;
use crate::detect::result::{BoundingBox, Detection, DetectionResult};
use crate::frame::{Frame, Shape};

const MOTION_CONFIDENCE: f32 = 0.85;
const DEFAULT_PIXEL_DELTA: u8 = 24;

/// Frame-differencing motion detector.
///
/// Identical frames are short-circuited by hash. Otherwise the luma planes of
/// consecutive frames are compared and the region whose pixels changed by more
/// than `pixel_delta` is reported as a single detection.
pub struct MotionBackend {
    last_hash: Option<[u8; 32]>,
    last_luma: Option<(Shape, Vec<u8>)>,
    pixel_delta: u8,
    config: ModelConfig,
}

impl MotionBackend {
    pub fn new() -> Self {
        Self {
            last_hash: None,
            last_luma: None,
            pixel_delta: DEFAULT_PIXEL_DELTA,
            config: ModelConfig::default(),
        }
    }
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let current_hash: [u8; 32] = Sha256::digest(frame.as_bytes()).into();
        let luma = luma_plane(frame);

        let region = match (&self.last_hash, &self.last_luma) {
            (Some(prev), _) if *prev == current_hash => None,
            (_, Some((shape, prev_luma))) if *shape == frame.shape() => {
                changed_region(prev_luma, &luma, frame.width(), self.pixel_delta)
            }
            _ => None,
        };

        self.last_hash = Some(current_hash);
        self.last_luma = Some((frame.shape(), luma));

        let class_id = self.config.primary_class();
        let results = region
            .filter(|_| MOTION_CONFIDENCE >= self.config.confidence_threshold)
            .filter(|_| self.config.includes_class(class_id))
            .map(|bbox| Detection {
                bbox,
                score: MOTION_CONFIDENCE,
                class_id,
            })
            .into_iter()
            .collect();

        Ok(DetectionResult {
            results,
            ..DetectionResult::default()
        })
    }

    fn configure(&mut self, config: &ModelConfig) -> Result<()> {
        self.config = config.clone();
        Ok(())
    }
}

fn luma_plane(frame: &Frame) -> Vec<u8> {
    frame
        .to_rgb8()
        .chunks_exact(3)
        .map(|px| ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8)
        .collect()
}

fn changed_region(prev: &[u8], current: &[u8], width: u32, delta: u8) -> Option<BoundingBox> {
    let width = width as usize;
    let mut bbox: Option<BoundingBox> = None;
    for (i, (&a, &b)) in prev.iter().zip(current).enumerate() {
        if a.abs_diff(b) <= delta {
            continue;
        }
        let x = (i % width) as u32;
        let y = (i / width) as u32;
        bbox = Some(match bbox {
            None => BoundingBox {
                xmin: x,
                ymin: y,
                xmax: x,
                ymax: y,
            },
            Some(b) => BoundingBox {
                xmin: b.xmin.min(x),
                ymin: b.ymin.min(y),
                xmax: b.xmax.max(x),
                ymax: b.ymax.max(y),
            },
        });
    }
    bbox
}
