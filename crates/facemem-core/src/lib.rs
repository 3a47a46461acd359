//! facemem-core: enroll labelled faces, recognize them later.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both running via
//! ONNX Runtime, on top of a small persisted embedding store.

pub mod alignment;
pub mod codec;
pub mod detector;
pub mod embedder;
pub mod enroll;
pub mod persist;
pub mod recognize;
pub mod recognizer;
pub mod store;
pub mod types;

pub use embedder::{default_model_dir, FaceEmbedder, OnnxEmbedder};
pub use enroll::{EnrollError, Enrolled, EnrollmentService};
pub use persist::{default_data_dir, FilePersistence, MemoryPersistence, Persistence};
pub use recognize::{RecognitionReport, RecognitionService, RecognitionStatus, RecognizeError};
pub use store::{EmbeddingStore, SharedStore};
pub use types::{DetectedFace, Embedding, IdentityRecord, Recognition, Thresholds, EMBEDDING_DIM};
