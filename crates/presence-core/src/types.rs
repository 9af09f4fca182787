use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Face embedding vector produced by the external recognition model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Return a unit-length copy, or `None` for zero, empty or non-finite vectors.
    pub fn normalized(&self) -> Option<Embedding> {
        let norm = self.norm();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        Some(Embedding {
            values: self.values.iter().map(|x| x / norm).collect(),
        })
    }

    /// Cosine similarity in [-1, 1]. Returns 0.0 if either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance (1 - cosine similarity): 0 for identical direction, 2 for opposite.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum EnrollError {
    #[error("identity id must not be empty")]
    EmptyId,
    #[error("enrollment requires at least one embedding")]
    NoEmbeddings,
    #[error("embedding {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("embedding {index} cannot be normalized (zero or non-finite vector)")]
    ZeroVector { index: usize },
}

/// One enrollment record: an identity with one or more unit-norm embeddings.
///
/// Records are append-only. Re-enrolling an identity creates a second
/// record with the same `id` and a fresh `record_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub record_id: Uuid,
    pub id: String,
    pub display_name: String,
    pub embeddings: Vec<Embedding>,
    pub enrolled_at: DateTime<Utc>,
}

impl EnrolledIdentity {
    /// Validate and normalize a batch of embeddings into a new record.
    ///
    /// All embeddings must share the dimension of the first one and have a
    /// non-zero norm. Either every embedding is accepted or none is.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        embeddings: Vec<Embedding>,
        enrolled_at: DateTime<Utc>,
    ) -> Result<Self, EnrollError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EnrollError::EmptyId);
        }
        let expected = embeddings.first().ok_or(EnrollError::NoEmbeddings)?.dim();

        let mut normalized = Vec::with_capacity(embeddings.len());
        for (index, embedding) in embeddings.iter().enumerate() {
            if embedding.dim() != expected {
                return Err(EnrollError::DimensionMismatch {
                    index,
                    expected,
                    actual: embedding.dim(),
                });
            }
            let unit = embedding
                .normalized()
                .ok_or(EnrollError::ZeroVector { index })?;
            normalized.push(unit);
        }

        Ok(Self {
            record_id: Uuid::new_v4(),
            id,
            display_name: display_name.into(),
            embeddings: normalized,
            enrolled_at,
        })
    }

    /// Embedding dimension of this record.
    pub fn dim(&self) -> usize {
        self.embeddings.first().map_or(0, Embedding::dim)
    }
}
