//! Face embedder seam: pixels in, one embedding per detected face out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("embedder models unavailable after an earlier panic")]
    Poisoned,
}

/// Anything that can turn an image into per-face embeddings.
///
/// Returns an empty vector, not an error, when the image has no faces.
pub trait FaceEmbedder: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedderError>;
}

/// Default directory for the buffalo_l ONNX files.
pub fn default_model_dir() -> PathBuf {
    crate::persist::default_data_dir().join("models")
}

struct Models {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

/// SCRFD + ArcFace pipeline running on ONNX Runtime.
///
/// Sessions need `&mut` to run, so calls are serialized behind a mutex.
pub struct OnnxEmbedder {
    models: Mutex<Models>,
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, EmbedderError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            models: Mutex::new(Models { detector, recognizer }),
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedderError> {
        let mut models = self.models.lock().map_err(|_| EmbedderError::Poisoned)?;
        let Models { detector, recognizer } = &mut *models;

        let boxes = detector.detect(image)?;
        boxes
            .iter()
            .map(|face| {
                Ok(DetectedFace {
                    embedding: recognizer.extract(image, face)?,
                    box_area: face.area(),
                })
            })
            .collect()
    }
}
