mod backend;
mod backends;
mod model;
mod registry;
mod result;

pub use backend::{run_detector, DetectorBackend, SharedBackend};
pub use backends::{MotionBackend, StubBackend};
pub use model::{ClassLabel, ModelConfig};
pub use registry::BackendRegistry;
pub use result::{BoundingBox, Detection, DetectionResult, ProcessingTime};
