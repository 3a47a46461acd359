use facemem_core::persist::{EMBEDDINGS_FILE, LABELS_FILE};
use facemem_core::{default_model_dir, FilePersistence, MemoryPersistence, Persistence, Thresholds};
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:8001).
    pub bind_addr: String,
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// Binary embedding matrix.
    pub embeddings_path: PathBuf,
    /// JSON label list, parallel to the matrix.
    pub labels_path: PathBuf,
    /// Dedup / recognition distances and the per-request face cap.
    pub thresholds: Thresholds,
    /// Largest accepted request body; base64 photos get big.
    pub max_body_bytes: usize,
    /// Keep the store in memory only.
    pub ephemeral: bool,
}

impl Config {
    /// Load configuration from `FACEMEM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("FACEMEM_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("facemem")
        });

        let parsed = |key: &str| var(key).and_then(|v| v.parse().ok());
        let defaults = Thresholds::default();

        Self {
            bind_addr: var("FACEMEM_BIND").unwrap_or_else(|| "0.0.0.0:8001".to_string()),
            model_dir: var("FACEMEM_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_model_dir),
            embeddings_path: var("FACEMEM_EMBEDDINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(EMBEDDINGS_FILE)),
            labels_path: var("FACEMEM_LABELS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(LABELS_FILE)),
            thresholds: Thresholds {
                dedup: parsed("FACEMEM_DEDUP_THRESHOLD").unwrap_or(defaults.dedup),
                recognition: parsed("FACEMEM_RECOGNITION_THRESHOLD").unwrap_or(defaults.recognition),
                max_faces: var("FACEMEM_MAX_FACES")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_faces),
            },
            max_body_bytes: var("FACEMEM_MAX_BODY_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20 * 1024 * 1024),
            ephemeral: var("FACEMEM_EPHEMERAL").is_some_and(|v| v != "0"),
        }
    }

    /// Storage backend selected by the configuration.
    pub fn persistence(&self) -> Box<dyn Persistence> {
        if self.ephemeral {
            tracing::warn!("FACEMEM_EPHEMERAL set: enrolled faces will not survive a restart");
            Box::new(MemoryPersistence::new())
        } else {
            Box::new(FilePersistence::new(&self.embeddings_path, &self.labels_path))
        }
    }
}
