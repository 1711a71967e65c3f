//! The detect + encode capability consumed by matching and enrollment.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, FaceVector};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// A detected face and its encoding.
#[derive(Debug, Clone)]
pub struct AnalyzedFace {
    pub bbox: BoundingBox,
    pub vector: FaceVector,
}

/// Finds every face in a packed RGB frame and encodes each one.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<AnalyzedFace>, AnalyzerError>;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<A> {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<AnalyzedFace>, AnalyzerError> {
        (**self).analyze(rgb, width, height)
    }
}

/// SCRFD detection followed by ArcFace encoding.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, AnalyzerError> {
        Ok(Self {
            detector: FaceDetector::load(scrfd_path)?,
            recognizer: FaceRecognizer::load(arcface_path)?,
        })
    }

    /// Load both models from their default file names inside `model_dir`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let path = |file: &str| model_dir.join(file).to_string_lossy().into_owned();
        Self::load(&path(SCRFD_MODEL_FILE), &path(ARCFACE_MODEL_FILE))
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<AnalyzedFace>, AnalyzerError> {
        let faces = self.detector.detect(rgb, width, height)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let frame = RgbImage::from_raw(width, height, rgb.to_vec())
            .ok_or_else(|| AnalyzerError::InvalidFrame(format!("{width}x{height} buffer too short")))?;

        faces
            .into_iter()
            .map(|bbox| -> Result<AnalyzedFace, AnalyzerError> {
                let vector = self.recognizer.encode(&frame, &bbox)?;
                Ok(AnalyzedFace { bbox, vector })
            })
            .collect()
    }
}
