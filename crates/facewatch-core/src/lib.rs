//! facewatch-core: face detection, encoding and matching.
//!
//! Uses SCRFD for detection and ArcFace for encoding, both running on ONNX
//! Runtime, plus the registered-face database the matcher works against.

pub mod alignment;
pub mod analyzer;
pub mod database;
pub mod detector;
pub mod enroll;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{AnalyzedFace, AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use database::{FaceDatabase, FaceStore, StorageError};
pub use matcher::{recognize, MATCH_TOLERANCE};
pub use types::{BoundingBox, Detection, FaceVector, UNKNOWN_NAME};

/// Where the ONNX models live when nothing else is configured:
/// `$XDG_DATA_HOME/facewatch/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch/models")
}
