//! Enrollment: remember the dominant face of an image under a label.

use crate::codec::{self, CodecError};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::store::{SharedStore, StoreError};
use crate::types::{DetectedFace, IdentityRecord, DEDUP_THRESHOLD};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("cannot decode image: {0}")]
    Decode(#[from] CodecError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face processing failed: {0}")]
    Detection(#[from] EmbedderError),
    #[error("person already enrolled as '{label}'")]
    AlreadyEnrolled { label: String, distance: f32 },
    #[error("face store error: {0}")]
    Store(#[from] StoreError),
    #[error("face store unavailable")]
    StoreUnavailable,
}

impl EnrollError {
    /// Stable machine-readable code; callers branch on this, not on the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyLabel => "validation_error",
            Self::Decode(_) => "decode_error",
            Self::NoFaceDetected => "no_face_detected",
            Self::Detection(_) => "detection_error",
            Self::AlreadyEnrolled { .. } => "already_enrolled",
            Self::Store(StoreError::Persistence(_)) => "persistence_error",
            Self::Store(StoreError::DimensionMismatch { .. } | StoreError::NonFiniteEmbedding) => {
                "invalid_embedding"
            }
            Self::Store(_) => "store_error",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

/// A successful enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrolled {
    pub label: String,
    pub index: usize,
}

impl Enrolled {
    /// Confirmation shown to the caller; carries the label verbatim.
    pub fn message(&self) -> String {
        format!("Ok! I'll remember that it's {}", self.label)
    }
}

pub struct EnrollmentService {
    store: SharedStore,
    embedder: Arc<dyn FaceEmbedder>,
    dedup_threshold: f32,
}

impl EnrollmentService {
    pub fn new(store: SharedStore, embedder: Arc<dyn FaceEmbedder>) -> Self {
        Self { store, embedder, dedup_threshold: DEDUP_THRESHOLD }
    }

    pub fn with_threshold(mut self, dedup_threshold: f32) -> Self {
        self.dedup_threshold = dedup_threshold;
        self
    }

    /// Enroll from a base64 transport payload.
    pub fn enroll(&self, image_base64: &str, label: &str) -> Result<Enrolled, EnrollError> {
        validate_label(label)?;
        let image = codec::decode_base64_image(image_base64)?;
        self.enroll_image(&image, label)
    }

    /// Enroll from decoded pixels.
    ///
    /// The embedder runs before the store lock is taken; repair, dedup and
    /// append then happen under one write lock. An embedding the store cannot
    /// hold is rejected before anything is compared or written.
    pub fn enroll_image(&self, image: &RgbImage, label: &str) -> Result<Enrolled, EnrollError> {
        validate_label(label)?;

        let faces = self.embedder.detect(image)?;
        let detected = faces.len();
        let face = dominant_face(faces).ok_or(EnrollError::NoFaceDetected)?;
        tracing::debug!(detected, box_area = face.box_area, "enroll: dominant face selected");

        let mut store = self.store.write().map_err(|_| EnrollError::StoreUnavailable)?;
        store.check_embedding(&face.embedding)?;
        store.repair()?;

        if let Some(hit) = store.nearest(&face.embedding) {
            if hit.distance < self.dedup_threshold {
                let existing = store.label(hit.index).map(str::to_owned).unwrap_or_default();
                tracing::info!(
                    label,
                    existing = %existing,
                    distance = hit.distance,
                    "enroll rejected: identity already present"
                );
                return Err(EnrollError::AlreadyEnrolled { label: existing, distance: hit.distance });
            }
        }

        let index = store.append(IdentityRecord {
            label: label.to_string(),
            embedding: face.embedding,
        })?;
        tracing::info!(label, index, "identity enrolled");

        Ok(Enrolled { label: label.to_string(), index })
    }
}

fn validate_label(label: &str) -> Result<(), EnrollError> {
    if label.trim().is_empty() {
        return Err(EnrollError::EmptyLabel);
    }
    Ok(())
}

/// Largest detection box wins; on equal areas the earlier face is kept.
fn dominant_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces
        .into_iter()
        .reduce(|best, face| if face.box_area > best.box_area { face } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::fake::{axis, face, tiny_png_base64, ScriptedEmbedder};
    use crate::persist::{FilePersistence, MemoryPersistence, Persistence};
    use crate::store::EmbeddingStore;
    use crate::types::{Embedding, EMBEDDING_DIM};
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn shared_store(persistence: impl Persistence + 'static) -> SharedStore {
        EmbeddingStore::open(Box::new(persistence), EMBEDDING_DIM)
            .unwrap()
            .into_shared()
    }

    fn service(store: &SharedStore, embedder: ScriptedEmbedder) -> EnrollmentService {
        EnrollmentService::new(store.clone(), Arc::new(embedder))
    }

    fn stored_labels(store: &SharedStore) -> Vec<String> {
        store.read().unwrap().labels().map(str::to_owned).collect()
    }

    #[test]
    fn test_enroll_returns_confirmation_with_label() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(&store, ScriptedEmbedder::new().then(vec![face(axis(0, 1.0), 100.0)]));

        let enrolled = svc.enroll(&tiny_png_base64(), "Grace Hopper").unwrap();
        assert_eq!(enrolled.index, 0);
        assert_eq!(enrolled.message(), "Ok! I'll remember that it's Grace Hopper");
        assert_eq!(stored_labels(&store), vec!["Grace Hopper"]);
    }

    #[test]
    fn test_empty_label_rejected_before_decoding() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(&store, ScriptedEmbedder::new().then(vec![face(axis(0, 1.0), 1.0)]));

        let err = svc.enroll("not even base64!", "  \t ").unwrap_err();
        assert!(matches!(err, EnrollError::EmptyLabel));
        assert_eq!(err.code(), "validation_error");
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_bad_payload_is_decode_error() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(&store, ScriptedEmbedder::new());
        let err = svc.enroll("@@@", "bob").unwrap_err();
        assert_eq!(err.code(), "decode_error");
    }

    #[test]
    fn test_no_face_detected() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(&store, ScriptedEmbedder::new().then(vec![]));
        let err = svc.enroll(&tiny_png_base64(), "bob").unwrap_err();
        assert!(matches!(err, EnrollError::NoFaceDetected));
    }

    #[test]
    fn test_detector_failure_propagates() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(&store, ScriptedEmbedder::new().then_fail());
        let err = svc.enroll(&tiny_png_base64(), "bob").unwrap_err();
        assert_eq!(err.code(), "detection_error");
    }

    #[test]
    fn test_wrong_dimension_rejected_before_dedup() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(
            &store,
            ScriptedEmbedder::new()
                .then(vec![face(axis(0, 1.0), 1.0)])
                .then(vec![face(Embedding::new(vec![1.0, 0.0, 0.0]), 1.0)]),
        );

        svc.enroll(&tiny_png_base64(), "alice").unwrap();
        let err = svc.enroll(&tiny_png_base64(), "short").unwrap_err();
        assert!(matches!(
            err,
            EnrollError::Store(StoreError::DimensionMismatch { expected: 512, got: 3 })
        ));
        assert_eq!(err.code(), "invalid_embedding");
        assert_eq!(stored_labels(&store), vec!["alice"]);
    }

    #[test]
    fn test_nan_embedding_is_never_stored() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(
            &store,
            ScriptedEmbedder::new()
                .then(vec![face(axis(0, f32::NAN), 1.0)])
                .then(vec![face(axis(0, 1.0), 1.0)]),
        );

        let err = svc.enroll(&tiny_png_base64(), "ghost").unwrap_err();
        assert!(matches!(err, EnrollError::Store(StoreError::NonFiniteEmbedding)));
        assert_eq!(err.code(), "invalid_embedding");

        svc.enroll(&tiny_png_base64(), "alice").unwrap();
        assert_eq!(stored_labels(&store), vec!["alice"]);
    }

    #[test]
    fn test_same_face_twice_is_rejected() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(
            &store,
            ScriptedEmbedder::new()
                .then(vec![face(axis(3, 1.0), 50.0)])
                .then(vec![face(axis(3, 1.0), 50.0)]),
        );

        svc.enroll(&tiny_png_base64(), "alice").unwrap();
        let err = svc.enroll(&tiny_png_base64(), "alice again").unwrap_err();
        match err {
            EnrollError::AlreadyEnrolled { label, distance } => {
                assert_eq!(label, "alice");
                assert_eq!(distance, 0.0);
            }
            other => panic!("expected AlreadyEnrolled, got {other:?}"),
        }
        assert_eq!(stored_labels(&store), vec!["alice"]);
    }

    #[test]
    fn test_distance_exactly_at_threshold_is_accepted() {
        let store = shared_store(MemoryPersistence::new());
        let svc = service(
            &store,
            ScriptedEmbedder::new()
                .then(vec![face(axis(0, 1.0), 1.0)])
                .then(vec![face(axis(0, 0.5), 1.0)]),
        );

        svc.enroll(&tiny_png_base64(), "first").unwrap();
        svc.enroll(&tiny_png_base64(), "second").unwrap();
        assert_eq!(stored_labels(&store), vec!["first", "second"]);
    }

    #[test]
    fn test_dominant_face_wins_regardless_of_order() {
        for faces in [
            vec![face(axis(1, 1.0), 100.0), face(axis(2, 1.0), 400.0)],
            vec![face(axis(2, 1.0), 400.0), face(axis(1, 1.0), 100.0)],
        ] {
            let store = shared_store(MemoryPersistence::new());
            let svc = service(&store, ScriptedEmbedder::new().then(faces));
            svc.enroll(&tiny_png_base64(), "big").unwrap();

            let record = store.read().unwrap().record(0).unwrap();
            assert_eq!(record.embedding, axis(2, 1.0));
        }
    }

    #[test]
    fn test_dominant_face_tie_keeps_first() {
        let picked = dominant_face(vec![
            face(axis(4, 1.0), 200.0),
            face(axis(5, 1.0), 200.0),
        ])
        .unwrap();
        assert_eq!(picked.embedding, axis(4, 1.0));
    }

    #[test]
    fn test_mismatched_store_is_repaired_before_dedup() {
        let dir = TempDir::new().unwrap();
        let files = FilePersistence::in_dir(dir.path());
        let embeddings: Vec<Embedding> = (0..3).map(|i| axis(i, 1.0)).collect();
        let labels: Vec<String> = (0..5).map(|i| format!("p{i}")).collect();
        files.save(&embeddings, &labels).unwrap();

        let store = shared_store(files.clone());
        // Duplicate of p1: rejected, but only after the repair ran.
        let svc = service(&store, ScriptedEmbedder::new().then(vec![face(axis(1, 1.0), 9.0)]));
        let err = svc.enroll(&tiny_png_base64(), "p1 again").unwrap_err();
        assert!(matches!(err, EnrollError::AlreadyEnrolled { ref label, .. } if label == "p1"));

        let reloaded = EmbeddingStore::open(Box::new(files), EMBEDDING_DIM).unwrap();
        assert!(reloaded.is_consistent());
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn test_mismatched_store_then_new_identity() {
        let dir = TempDir::new().unwrap();
        let files = FilePersistence::in_dir(dir.path());
        let embeddings: Vec<Embedding> = (0..3).map(|i| axis(i, 1.0)).collect();
        let labels: Vec<String> = (0..5).map(|i| format!("p{i}")).collect();
        files.save(&embeddings, &labels).unwrap();

        let store = shared_store(files.clone());
        let svc = service(&store, ScriptedEmbedder::new().then(vec![face(axis(9, 1.0), 9.0)]));
        let enrolled = svc.enroll(&tiny_png_base64(), "newcomer").unwrap();
        assert_eq!(enrolled.index, 3);

        let artifacts = files.load().unwrap();
        assert_eq!(artifacts.embeddings.unwrap().len(), 4);
        assert_eq!(
            artifacts.labels.unwrap(),
            vec!["p0", "p1", "p2", "newcomer"]
        );
    }

    #[test]
    fn test_persist_failure_surfaces_and_retry_succeeds() {
        let memory = Arc::new(MemoryPersistence::new());
        let store = shared_store(memory.clone());
        let svc = service(
            &store,
            ScriptedEmbedder::new()
                .then(vec![face(axis(0, 1.0), 1.0)])
                .then(vec![face(axis(0, 1.0), 1.0)]),
        );

        memory.set_fail_saves(true);
        let err = svc.enroll(&tiny_png_base64(), "carol").unwrap_err();
        assert_eq!(err.code(), "persistence_error");

        memory.set_fail_saves(false);
        svc.enroll(&tiny_png_base64(), "carol").unwrap();
        assert_eq!(memory.snapshot().labels.unwrap(), vec!["carol"]);
    }

    #[test]
    fn test_concurrent_near_duplicates_store_one_record() {
        let store = shared_store(MemoryPersistence::new());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [axis(0, 1.0), axis(0, 0.9)]
            .into_iter()
            .enumerate()
            .map(|(i, embedding)| {
                let svc = service(&store, ScriptedEmbedder::new().then(vec![face(embedding, 10.0)]));
                let barrier = barrier.clone();
                let payload = tiny_png_base64();
                std::thread::spawn(move || {
                    barrier.wait();
                    svc.enroll(&payload, &format!("racer {i}"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EnrollError::AlreadyEnrolled { .. }))));
        assert_eq!(store.read().unwrap().len(), 1);
    }
}
