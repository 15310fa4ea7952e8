use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};

use super::backend::{DetectorBackend, SharedBackend};
use super::backends::{MotionBackend, StubBackend};
use super::model::ModelConfig;

type BackendFactory = Box<dyn Fn(&ModelConfig) -> Result<SharedBackend> + Send + Sync>;

/// Thread-safe registry of detector backend factories.
///
/// Backends keep per-stream state (the motion backend remembers the previous
/// frame), so the registry never hands out a shared instance: every caller of
/// `instantiate` gets a fresh backend configured with the current
/// `ModelConfig`. Backends are wrapped in `Mutex` because
/// `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    default_name: Option<String>,
    model_config: RwLock<ModelConfig>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
            model_config: RwLock::new(ModelConfig::default()),
        }
    }

    /// Registry with the built-in `stub` and `motion` backends, configured
    /// with `model` and defaulting to `default_backend`.
    pub fn builtin(default_backend: &str, model: ModelConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(StubBackend::new)?;
        registry.register(MotionBackend::new)?;
        registry.configure(model)?;
        registry.set_default(default_backend)?;
        Ok(registry)
    }

    /// Register a backend factory. The first registered backend becomes the default.
    ///
    /// One instance is built up front to learn the backend name and to check
    /// that it accepts the current configuration.
    pub fn register<B, F>(&mut self, make: F) -> Result<()>
    where
        B: DetectorBackend + 'static,
        F: Fn() -> B + Send + Sync + 'static,
    {
        let mut first = make();
        first.configure(&self.model_config())?;
        let name = first.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        let factory: BackendFactory = Box::new(move |config: &ModelConfig| {
            let mut backend = make();
            backend.configure(config)?;
            let shared: SharedBackend = Arc::new(Mutex::new(backend));
            Ok(shared)
        });
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Build a fresh backend by name, configured with the current model config.
    pub fn instantiate(&self, name: &str) -> Result<SharedBackend> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        factory(&self.model_config())
    }

    /// Build a fresh instance of the default backend.
    pub fn instantiate_default(&self) -> Result<SharedBackend> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.instantiate(name)
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate a model configuration and make it the template for new backends.
    ///
    /// Every registered backend must accept it before it is stored. Backends
    /// already handed out keep the configuration they were built with.
    pub fn configure(&self, config: ModelConfig) -> Result<()> {
        config.validate()?;
        for (name, factory) in &self.factories {
            factory(&config).map_err(|err| err.context(format!("backend '{}'", name)))?;
        }
        let mut current = self
            .model_config
            .write()
            .map_err(|_| anyhow!("model config lock poisoned"))?;
        *current = config;
        Ok(())
    }

    pub fn model_config(&self) -> ModelConfig {
        match self.model_config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backend::run_detector;
    use crate::frame::Frame;

    /// Accepts any config except one that selects class 7.
    struct PickyBackend;

    impl DetectorBackend for PickyBackend {
        fn name(&self) -> &'static str {
            "picky"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<crate::detect::DetectionResult> {
            Ok(Default::default())
        }

        fn configure(&mut self, config: &ModelConfig) -> Result<()> {
            if config.includes_class(7) {
                anyhow::bail!("class 7 is not supported");
            }
            Ok(())
        }
    }

    #[test]
    fn first_backend_is_default_until_changed() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new)?;
        registry.register(MotionBackend::new)?;
        assert_eq!(registry.default_name(), Some("stub"));
        assert_eq!(registry.list(), vec!["motion", "stub"]);

        registry.set_default("motion")?;
        assert_eq!(registry.default_name(), Some("motion"));
        assert!(registry.set_default("tract").is_err());
        assert!(registry.instantiate("tract").is_err());
        assert!(BackendRegistry::new().instantiate_default().is_err());
        Ok(())
    }

    #[test]
    fn builtin_registry_honours_default_and_model() -> Result<()> {
        let model = ModelConfig {
            confidence_threshold: 0.3,
            ..ModelConfig::default()
        };
        let registry = BackendRegistry::builtin("motion", model.clone())?;
        assert_eq!(registry.default_name(), Some("motion"));
        assert_eq!(registry.model_config(), model);
        assert!(BackendRegistry::builtin("yolo", ModelConfig::default()).is_err());
        Ok(())
    }

    #[test]
    fn configure_rejects_invalid_config_and_keeps_previous() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(MotionBackend::new)?;

        let bad = ModelConfig {
            classes: vec![],
            ..ModelConfig::default()
        };
        assert!(registry.configure(bad).is_err());
        assert_eq!(registry.model_config(), ModelConfig::default());

        let good = ModelConfig {
            confidence_threshold: 0.4,
            ..ModelConfig::default()
        };
        registry.configure(good.clone())?;
        assert_eq!(registry.model_config(), good);
        Ok(())
    }

    #[test]
    fn config_rejected_by_one_backend_is_not_stored() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(MotionBackend::new)?;
        registry.register(|| PickyBackend)?;

        let mut rejected = ModelConfig::default();
        rejected.classes[0].id = 7;
        assert!(registry.configure(rejected).is_err());
        assert_eq!(registry.model_config(), ModelConfig::default());
        assert!(registry.instantiate("picky").is_ok());
        Ok(())
    }

    #[test]
    fn each_instance_keeps_its_own_motion_state() -> Result<()> {
        let registry = BackendRegistry::builtin("motion", ModelConfig::default())?;
        let dark = Frame::from_rgb(8, 8, vec![10; 8 * 8 * 3])?;
        let bright = Frame::from_rgb(8, 8, vec![200; 8 * 8 * 3])?;
        let first_camera = registry.instantiate_default()?;
        let second_camera = registry.instantiate_default()?;

        let mut detections = Vec::new();
        for _ in 0..3 {
            detections.push(run_detector(&first_camera, &dark)?.results.len());
            detections.push(run_detector(&second_camera, &bright)?.results.len());
        }
        assert_eq!(detections, vec![0; 6]);
        Ok(())
    }
}
