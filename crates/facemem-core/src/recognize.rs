//! Recognition: match every face in an image against the store.

use crate::codec::{self, CodecError};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::store::SharedStore;
use crate::types::{confidence_from_distance, Recognition, MAX_FACES_PER_IMAGE, RECOGNITION_THRESHOLD};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] CodecError),
    #[error("face processing failed: {0}")]
    Detection(#[from] EmbedderError),
    #[error("face store unavailable")]
    StoreUnavailable,
}

impl RecognizeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::Detection(_) => "detection_error",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Why a recognition result looks the way it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStatus {
    /// Faces were compared against the store; `matches` may still be empty.
    Completed,
    NoFaces,
    EmptyDatabase,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionReport {
    pub status: RecognitionStatus,
    /// Faces reported by the embedder, before the per-request cap.
    pub faces_detected: usize,
    /// Matches in detection order. Unmatched faces are omitted.
    pub matches: Vec<Recognition>,
}

impl RecognitionReport {
    fn empty(status: RecognitionStatus, faces_detected: usize) -> Self {
        Self { status, faces_detected, matches: Vec::new() }
    }
}

pub struct RecognitionService {
    store: SharedStore,
    embedder: Arc<dyn FaceEmbedder>,
    threshold: f32,
    max_faces: usize,
}

impl RecognitionService {
    pub fn new(store: SharedStore, embedder: Arc<dyn FaceEmbedder>) -> Self {
        Self {
            store,
            embedder,
            threshold: RECOGNITION_THRESHOLD,
            max_faces: MAX_FACES_PER_IMAGE,
        }
    }

    pub fn with_limits(mut self, threshold: f32, max_faces: usize) -> Self {
        self.threshold = threshold;
        self.max_faces = max_faces;
        self
    }

    pub fn recognize(&self, image_base64: &str) -> Result<RecognitionReport, RecognizeError> {
        let image = codec::decode_base64_image(image_base64)?;
        self.recognize_image(&image)
    }

    /// Embeds outside the lock, then matches under a shared read lock.
    pub fn recognize_image(&self, image: &RgbImage) -> Result<RecognitionReport, RecognizeError> {
        let mut faces = self.embedder.detect(image)?;
        let faces_detected = faces.len();
        if faces.is_empty() {
            return Ok(RecognitionReport::empty(RecognitionStatus::NoFaces, 0));
        }
        faces.truncate(self.max_faces);

        let store = self.store.read().map_err(|_| RecognizeError::StoreUnavailable)?;
        if store.is_empty() {
            return Ok(RecognitionReport::empty(RecognitionStatus::EmptyDatabase, faces_detected));
        }

        let matches: Vec<Recognition> = faces
            .iter()
            .filter_map(|face| {
                if let Err(e) = store.check_embedding(&face.embedding) {
                    tracing::warn!(error = %e, "recognize: face skipped");
                    return None;
                }
                let hit = store.nearest(&face.embedding)?;
                if !(hit.distance < self.threshold) {
                    return None;
                }
                Some(Recognition {
                    label: store.label(hit.index)?.to_owned(),
                    confidence: confidence_from_distance(hit.distance),
                })
            })
            .collect();

        tracing::info!(
            faces_detected,
            evaluated = faces.len(),
            matched = matches.len(),
            "recognition complete"
        );

        Ok(RecognitionReport {
            status: RecognitionStatus::Completed,
            faces_detected,
            matches,
        })
    }
}
