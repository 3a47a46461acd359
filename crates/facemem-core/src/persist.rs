//! Durable storage for the two store artifacts: the embedding matrix and the
//! label list.
//!
//! Each artifact is replaced atomically (temp file + rename). The pair is not:
//! embeddings are written before labels, and the store's repair step absorbs a
//! crash in between.

use crate::types::Embedding;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use thiserror::Error;

const MATRIX_MAGIC: &[u8; 4] = b"FMEB";
const MATRIX_VERSION: u32 = 1;
const MATRIX_HEADER_LEN: usize = 4 + 4 + 4 + 8;

pub const EMBEDDINGS_FILE: &str = "face_embeddings.bin";
pub const LABELS_FILE: &str = "labels.json";

/// `$XDG_DATA_HOME/facemem`, falling back to `~/.local/share/facemem`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facemem")
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt embeddings file {path}: {reason}")]
    CorruptMatrix { path: PathBuf, reason: String },
    #[error("corrupt labels file {path}: {source}")]
    CorruptLabels {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("embedding rows must share one dimension")]
    RaggedMatrix,
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

/// Whatever was found on disk. `None` means the artifact does not exist.
#[derive(Debug, Default, Clone)]
pub struct Artifacts {
    pub embeddings: Option<Vec<Embedding>>,
    pub labels: Option<Vec<String>>,
}

/// Durable home for the store's two parallel artifacts.
pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<Artifacts, PersistError>;
    fn save(&self, embeddings: &[Embedding], labels: &[String]) -> Result<(), PersistError>;
}

impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn load(&self) -> Result<Artifacts, PersistError> {
        (**self).load()
    }

    fn save(&self, embeddings: &[Embedding], labels: &[String]) -> Result<(), PersistError> {
        (**self).save(embeddings, labels)
    }
}

/// File-backed persistence: a binary matrix plus a JSON label list.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    embeddings_path: PathBuf,
    labels_path: PathBuf,
}

impl FilePersistence {
    pub fn new(embeddings_path: impl Into<PathBuf>, labels_path: impl Into<PathBuf>) -> Self {
        Self {
            embeddings_path: embeddings_path.into(),
            labels_path: labels_path.into(),
        }
    }

    /// Both artifacts under `dir` with their default file names.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(EMBEDDINGS_FILE), dir.join(LABELS_FILE))
    }

    pub fn embeddings_path(&self) -> &Path {
        &self.embeddings_path
    }

    pub fn labels_path(&self) -> &Path {
        &self.labels_path
    }
}

impl Persistence for FilePersistence {
    fn load(&self) -> Result<Artifacts, PersistError> {
        let embeddings = read_optional(&self.embeddings_path)?
            .map(|bytes| decode_matrix(&bytes, &self.embeddings_path))
            .transpose()?;

        let labels = read_optional(&self.labels_path)?
            .map(|bytes| {
                serde_json::from_slice::<Vec<String>>(&bytes).map_err(|source| {
                    PersistError::CorruptLabels { path: self.labels_path.clone(), source }
                })
            })
            .transpose()?;

        Ok(Artifacts { embeddings, labels })
    }

    fn save(&self, embeddings: &[Embedding], labels: &[String]) -> Result<(), PersistError> {
        let matrix = encode_matrix(embeddings)?;
        write_atomic(&self.embeddings_path, &matrix)?;

        let labels_json = serde_json::to_vec(labels).map_err(|source| PersistError::CorruptLabels {
            path: self.labels_path.clone(),
            source,
        })?;
        write_atomic(&self.labels_path, &labels_json)?;

        tracing::debug!(
            rows = embeddings.len(),
            labels = labels.len(),
            path = %self.embeddings_path.display(),
            "store artifacts saved"
        );
        Ok(())
    }
}

/// Volatile persistence for ephemeral daemons and tests.
///
/// `fail_saves` makes every subsequent save fail, for exercising error paths.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<Artifacts>,
    fail_saves: Mutex<bool>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from pre-existing artifacts, possibly inconsistent ones.
    pub fn with_artifacts(artifacts: Artifacts) -> Self {
        Self {
            state: Mutex::new(artifacts),
            fail_saves: Mutex::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_saves.lock() {
            *flag = fail;
        }
    }

    /// Copy of what a fresh load would return.
    pub fn snapshot(&self) -> Artifacts {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Artifacts, PersistError> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| PersistError::Unavailable("memory state poisoned".into()))
    }

    fn save(&self, embeddings: &[Embedding], labels: &[String]) -> Result<(), PersistError> {
        let failing = self.fail_saves.lock().map(|f| *f).unwrap_or(true);
        if failing {
            return Err(PersistError::Unavailable("saves disabled".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| PersistError::Unavailable("memory state poisoned".into()))?;
        *state = Artifacts {
            embeddings: Some(embeddings.to_vec()),
            labels: Some(labels.to_vec()),
        };
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PersistError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PersistError::Io { path: path.to_path_buf(), source }),
    }
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let io_err = |source: io::Error| PersistError::Io { path: path.to_path_buf(), source };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn encode_matrix(rows: &[Embedding]) -> Result<Vec<u8>, PersistError> {
    let dim = rows.first().map_or(0, Embedding::dim);
    if rows.iter().any(|r| r.dim() != dim) {
        return Err(PersistError::RaggedMatrix);
    }

    let mut out = Vec::with_capacity(MATRIX_HEADER_LEN + rows.len() * dim * 4);
    out.extend_from_slice(MATRIX_MAGIC);
    out.extend_from_slice(&MATRIX_VERSION.to_le_bytes());
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    for row in rows {
        for v in row.values() {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(out)
}

fn decode_matrix(bytes: &[u8], path: &Path) -> Result<Vec<Embedding>, PersistError> {
    let corrupt = |reason: String| PersistError::CorruptMatrix { path: path.to_path_buf(), reason };

    if bytes.len() < MATRIX_HEADER_LEN {
        return Err(corrupt(format!("{} bytes is shorter than the header", bytes.len())));
    }
    let (header, body) = bytes.split_at(MATRIX_HEADER_LEN);
    if &header[0..4] != MATRIX_MAGIC {
        return Err(corrupt("bad magic".into()));
    }

    let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let version = u32_at(4);
    if version != MATRIX_VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }
    let dim = u32_at(8) as usize;
    let mut count = [0u8; 8];
    count.copy_from_slice(&header[12..20]);
    let rows = u64::from_le_bytes(count) as usize;

    let expected = rows
        .checked_mul(dim)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt(format!("{rows} rows × {dim} dims overflows")))?;
    if body.len() != expected {
        return Err(corrupt(format!(
            "expected {expected} body bytes for {rows}×{dim}, found {}",
            body.len()
        )));
    }
    if rows == 0 {
        return Ok(Vec::new());
    }
    if dim == 0 {
        return Err(corrupt(format!("{rows} rows with zero dimension")));
    }

    let floats: Vec<f32> = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(floats.chunks_exact(dim).map(|row| Embedding::new(row.to_vec())).collect())
}
