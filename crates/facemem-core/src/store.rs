//! The face-embedding store: an append-only list of identity records backed
//! by two parallel persisted artifacts.
//!
//! The in-memory shape mirrors the artifacts (one embedding list, one label
//! list) so that a torn write from an earlier run can be seen and repaired
//! instead of being papered over at load time.

use crate::persist::{Artifacts, PersistError, Persistence};
use crate::types::{Embedding, IdentityRecord};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistError),
    #[error("embedding has {got} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding contains NaN or infinite values")]
    NonFiniteEmbedding,
    #[error("stored embedding {index} has {got} dimensions, store expects {expected}")]
    CorruptRow { index: usize, expected: usize, got: usize },
}

/// Store shared between the enrollment and recognition services.
pub type SharedStore = Arc<RwLock<EmbeddingStore>>;

/// Closest stored record to a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

/// Outcome of a consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    Consistent,
    Truncated { labels: usize, embeddings: usize, kept: usize },
}

pub struct EmbeddingStore {
    dim: usize,
    embeddings: Vec<Embedding>,
    labels: Vec<String>,
    persistence: Box<dyn Persistence>,
}

impl EmbeddingStore {
    /// Load the persisted artifacts, or start empty if there are none.
    ///
    /// A lone artifact is treated as corrupt: the missing one counts as empty
    /// and the next enrollment repairs the pair.
    pub fn open(persistence: Box<dyn Persistence>, dim: usize) -> Result<Self, StoreError> {
        let Artifacts { embeddings, labels } = persistence.load()?;

        let (embeddings, labels) = match (embeddings, labels) {
            (Some(e), Some(l)) => (e, l),
            (None, None) => {
                tracing::info!("no persisted face store found; starting empty");
                (Vec::new(), Vec::new())
            }
            (e, l) => {
                tracing::warn!(
                    embeddings_present = e.is_some(),
                    labels_present = l.is_some(),
                    "store corruption: only one artifact present; will repair on next enrollment"
                );
                (e.unwrap_or_default(), l.unwrap_or_default())
            }
        };

        if let Some((index, row)) = embeddings.iter().enumerate().find(|(_, r)| r.dim() != dim) {
            return Err(StoreError::CorruptRow { index, expected: dim, got: row.dim() });
        }

        if embeddings.len() != labels.len() {
            tracing::warn!(
                embeddings = embeddings.len(),
                labels = labels.len(),
                "store corruption: artifact lengths differ; will repair on next enrollment"
            );
        }
        tracing::info!(records = embeddings.len().min(labels.len()), dim, "face store loaded");

        Ok(Self { dim, embeddings, labels, persistence })
    }

    /// Wrap in the lock shared by the services.
    pub fn into_shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of complete (label, embedding) pairs.
    pub fn len(&self) -> usize {
        self.embeddings.len().min(self.labels.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both artifacts have the same length.
    pub fn is_consistent(&self) -> bool {
        self.embeddings.len() == self.labels.len()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        (index < self.len()).then(|| self.labels[index].as_str())
    }

    pub fn record(&self, index: usize) -> Option<IdentityRecord> {
        (index < self.len()).then(|| IdentityRecord {
            label: self.labels[index].clone(),
            embedding: self.embeddings[index].clone(),
        })
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels[..self.len()].iter().map(String::as_str)
    }

    /// Truncate both lists to the shorter one and persist if they disagree.
    ///
    /// The in-memory truncation always happens; only the save can fail.
    pub fn repair(&mut self) -> Result<Repair, StoreError> {
        if self.is_consistent() {
            return Ok(Repair::Consistent);
        }

        let (labels, embeddings) = (self.labels.len(), self.embeddings.len());
        let kept = labels.min(embeddings);
        tracing::error!(labels, embeddings, "store corruption: label/embedding count mismatch");

        self.labels.truncate(kept);
        self.embeddings.truncate(kept);
        self.persistence.save(&self.embeddings, &self.labels)?;

        tracing::warn!(kept, "face store repaired by truncation");
        Ok(Repair::Truncated { labels, embeddings, kept })
    }

    /// Whether `embedding` can be compared against or stored in this store.
    pub fn check_embedding(&self, embedding: &Embedding) -> Result<(), StoreError> {
        if embedding.dim() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                got: embedding.dim(),
            });
        }
        if !embedding.is_finite() {
            return Err(StoreError::NonFiniteEmbedding);
        }
        Ok(())
    }

    /// Linear scan for the closest stored embedding; ties go to the lowest index.
    ///
    /// Rows at a non-finite distance are never a neighbor. Returns `None` on an
    /// empty store or when no row compares.
    pub fn nearest(&self, query: &Embedding) -> Option<Neighbor> {
        let mut best: Option<Neighbor> = None;
        for (index, stored) in self.embeddings[..self.len()].iter().enumerate() {
            let distance = query.euclidean_distance(stored);
            if !distance.is_finite() {
                continue;
            }
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Neighbor { index, distance });
            }
        }
        best
    }

    /// Append one record and persist both artifacts.
    ///
    /// Repairs first, like every mutation. On a failed save the append is
    /// rolled back so memory matches the last successful commit.
    pub fn append(&mut self, record: IdentityRecord) -> Result<usize, StoreError> {
        self.check_embedding(&record.embedding)?;
        self.repair()?;

        let index = self.embeddings.len();
        self.embeddings.push(record.embedding);
        self.labels.push(record.label);

        if let Err(e) = self.persistence.save(&self.embeddings, &self.labels) {
            self.embeddings.truncate(index);
            self.labels.truncate(index);
            tracing::error!(error = %e, "failed to persist face store; append rolled back");
            return Err(e.into());
        }

        tracing::info!(index, records = self.len(), "identity appended");
        Ok(index)
    }
}
