//! veil-core — Face detection and anonymization engine.
//!
//! Uses SCRFD for face detection via ONNX Runtime, a box filter to blur the
//! detected regions, and EXIF (or a JSON sidecar) to record face coordinates.

pub mod anonymizer;
pub mod detector;
pub mod format;
pub mod metadata;
pub mod types;

use std::path::PathBuf;

pub use anonymizer::Anonymizer;
pub use detector::{Detect, DetectorError, FaceDetector};
pub use format::PhotoFormat;
pub use types::{BoundingBox, FaceRecord, FaceRegion};

/// Models directory used when none is configured: `models/` under the working directory.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
