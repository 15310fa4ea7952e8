use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::detect::ModelConfig;
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::ingest::{CameraSettings, ReconnectPolicy};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8001";
const DEFAULT_TARGET_FPS: u32 = 60;
const DEFAULT_RESET_ATTEMPTS: u32 = 2;
const DEFAULT_RESET_DELAY_SECS: u64 = 5;
const DEFAULT_BACKEND: &str = "motion";
const DEFAULT_CAMERA_ID: &str = "test";
const DEFAULT_CAMERA_URL: &str = "stub://test?width=320&height=240";

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    api: Option<ApiConfigFile>,
    stream: Option<StreamConfigFile>,
    backend: Option<String>,
    model: Option<ModelConfig>,
    cameras: Option<HashMap<String, CameraSettings>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    target_fps: Option<u32>,
    reset_attempts: Option<u32>,
    reset_delay_secs: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_addr: String,
    pub stream: StreamSettings,
    pub backend: String,
    pub model: ModelConfig,
    pub cameras: HashMap<String, CameraSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Inference rate per session; 0 runs the detector on every frame.
    pub target_fps: u32,
    pub reset_attempts: u32,
    pub reset_delay: Duration,
    pub jpeg_quality: u8,
}

impl StreamSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reset_attempts, self.reset_delay)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            reset_attempts: DEFAULT_RESET_ATTEMPTS,
            reset_delay: Duration::from_secs(DEFAULT_RESET_DELAY_SECS),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(AppConfigFile::default())
    }
}

impl AppConfig {
    /// File named by `CAMSTREAM_CONFIG` (if any), then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMSTREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => AppConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            target_fps: stream.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            reset_attempts: stream.reset_attempts.unwrap_or(DEFAULT_RESET_ATTEMPTS),
            reset_delay: Duration::from_secs(
                stream.reset_delay_secs.unwrap_or(DEFAULT_RESET_DELAY_SECS),
            ),
            jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };
        let mut cameras = file.cameras.unwrap_or_default();
        if cameras.is_empty() {
            cameras.insert(
                DEFAULT_CAMERA_ID.to_string(),
                CameraSettings::from_url(DEFAULT_CAMERA_URL),
            );
        }
        Self {
            api_addr,
            stream,
            backend: file.backend.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model: file.model.unwrap_or_default(),
            cameras,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMSTREAM_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(backend) = std::env::var("CAMSTREAM_BACKEND") {
            if !backend.trim().is_empty() {
                self.backend = backend.trim().to_string();
            }
        }
        if let Ok(fps) = std::env::var("CAMSTREAM_TARGET_FPS") {
            self.stream.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMSTREAM_TARGET_FPS must be a non-negative integer"))?;
        }
        if let Ok(attempts) = std::env::var("CAMSTREAM_RESET_ATTEMPTS") {
            self.stream.reset_attempts = attempts
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMSTREAM_RESET_ATTEMPTS must be a non-negative integer"))?;
        }
        if let Ok(delay) = std::env::var("CAMSTREAM_RESET_DELAY_SECS") {
            let seconds: u64 = delay.trim().parse().map_err(|_| {
                anyhow!("CAMSTREAM_RESET_DELAY_SECS must be an integer number of seconds")
            })?;
            self.stream.reset_delay = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("stream.jpeg_quality must be within 1..=100"));
        }
        self.model.validate()?;

        let mut cameras = HashMap::with_capacity(self.cameras.len());
        for (id, settings) in self.cameras.drain() {
            validate_camera_id(&id)?;
            settings
                .source_uri()
                .map_err(|e| anyhow!("camera '{}': {:#}", id, e))?;
            let id = id.to_lowercase();
            if cameras.insert(id.clone(), settings).is_some() {
                return Err(anyhow!("camera id '{}' is configured twice", id));
            }
        }
        self.cameras = cameras;
        Ok(())
    }

    /// Sorted camera ids.
    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Camera ids are 1..64 characters of `[a-z0-9_-]`, compared lowercased.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<Result<regex::Regex, regex::Error>> = OnceLock::new();
    let re = CAMERA_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$"))
        .as_ref()
        .map_err(|e| anyhow!("camera id pattern: {}", e))?;

    if !re.is_match(&camera_id.to_lowercase()) {
        return Err(anyhow!(
            "camera id '{}' must match ^[a-z0-9_-]{{1,64}}$",
            camera_id
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_ids_follow_allowlist() {
        assert!(validate_camera_id("stream0").is_ok());
        assert!(validate_camera_id("Front_Door-2").is_ok());
        assert!(validate_camera_id("").is_err());
        assert!(validate_camera_id("../etc").is_err());
        assert!(validate_camera_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn defaults_provide_stub_camera() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
        assert_eq!(cfg.stream, StreamSettings::default());
        assert_eq!(cfg.camera_ids(), vec![DEFAULT_CAMERA_ID.to_string()]);
        assert_eq!(
            cfg.stream.reconnect_policy(),
            ReconnectPolicy::new(2, Duration::from_secs(5))
        );
    }
}
