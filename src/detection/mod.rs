mod alert;
mod object;
mod service;
mod validate;

pub use alert::{AlertDispatcher, AlertSink, DispatchOutcome, HttpAlertSink, OccupancyReport};
pub use object::{Detection, InferenceError, ObjectDetector, OnnxPersonCounter, PersonCounter};
pub use service::{DetectError, DetectionRequest, DetectionResult, DetectionService, ResultStatus};
pub use validate::{ImageValidator, ValidationError, MAX_IMAGE_BYTES};
