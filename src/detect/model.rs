use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEVICE: &str = "cpu";
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.85;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

/// A class the model may report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLabel {
    pub id: u32,
    pub name: String,
}

/// Model parameters selected from the dashboard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_device")]
    pub device: String,
    pub classes: Vec<ClassLabel>,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou")]
    pub iou_threshold: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            device: default_device(),
            classes: vec![
                ClassLabel {
                    id: 0,
                    name: "class0".to_string(),
                },
                ClassLabel {
                    id: 1,
                    name: "class1".to_string(),
                },
            ],
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(anyhow!("at least one class must be selected for recognition"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow!(
                "iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.device.trim().is_empty() {
            return Err(anyhow!("device must not be empty"));
        }
        Ok(())
    }

    pub fn includes_class(&self, id: u32) -> bool {
        self.classes.iter().any(|class| class.id == id)
    }

    /// Class reported when a backend has no labels of its own.
    pub fn primary_class(&self) -> u32 {
        self.classes.first().map(|class| class.id).unwrap_or(0)
    }
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_confidence() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_iou() -> f32 {
    DEFAULT_IOU_THRESHOLD
}
