mod backend;
pub mod backends;
mod result;
mod stack;

pub use backend::Detector;
pub use backends::{MotionDetector, NullDetector};
pub use result::{AnalysisResult, BoundingBox, Detection, DetectionCategory};
pub use stack::{default_factory, DetectorFactory, DetectorStack, StackOutput};

#[cfg(feature = "backend-tract")]
pub use backends::OnnxDetector;
