//! In-memory vector index with nearest-neighbor search.
//!
//! Entries are kept in insertion order so that queries and snapshots are
//! deterministic. The metric is cosine distance `1 - cos(a, b)`: lower means
//! more similar, ties are broken by lowest insertion sequence.

use crate::eid::Eid;
use crate::snapshot::Snapshot;

/// One admitted (vector, text) pair. Immutable once created.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: Eid,
    /// Monotonic insertion counter, unique within an index lifetime.
    pub seq: u64,
    pub vector: Vec<f32>,
    pub text: String,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot store or search a zero-norm vector")]
    ZeroNormVector,

    #[error("snapshot entries out of order at seq {seq}")]
    OutOfOrder { seq: u64 },
}

/// In-memory nearest-neighbor store over admitted entries.
pub struct VectorIndex {
    entries: Vec<Entry>,
    dimensions: usize,
    next_seq: u64,
}

impl VectorIndex {
    /// Create a new empty index with a fixed dimension.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: Vec::new(),
            dimensions,
            next_seq: 0,
        }
    }

    /// Rebuild an index from a snapshot, validating its structure.
    ///
    /// Fails if any vector disagrees with the snapshot dimension, has zero
    /// norm, or the sequence numbers are not strictly increasing.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, IndexError> {
        let mut last_seq = None;
        for entry in &snapshot.entries {
            Self::validate_vector(snapshot.dimensions, &entry.vector)?;
            if last_seq.is_some_and(|prev| entry.seq <= prev) {
                return Err(IndexError::OutOfOrder { seq: entry.seq });
            }
            last_seq = Some(entry.seq);
        }

        let next_seq = last_seq.map(|seq| seq + 1).unwrap_or(0);

        Ok(Self {
            entries: snapshot.entries,
            dimensions: snapshot.dimensions,
            next_seq,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Append a new entry with a fresh id and the next sequence number.
    pub fn insert(&mut self, vector: Vec<f32>, text: String) -> Result<&Entry, IndexError> {
        Self::validate_vector(self.dimensions, &vector)?;

        let entry = Entry {
            id: Eid::new(),
            seq: self.next_seq,
            vector,
            text,
        };
        self.next_seq += 1;
        self.entries.push(entry);

        Ok(self.entries.last().expect("just pushed"))
    }

    /// Find the entry nearest to `query` under cosine distance.
    ///
    /// Returns `None` on an empty index. Deterministic: entries are scanned
    /// in insertion order and only a strictly smaller distance replaces the
    /// current best, so ties resolve to the lowest sequence number.
    pub fn nearest(&self, query: &[f32]) -> Result<Option<(&Entry, f32)>, IndexError> {
        Self::validate_vector(self.dimensions, query)?;

        let query_norm = l2_norm(query);

        let mut best: Option<(&Entry, f32)> = None;
        for entry in &self.entries {
            let distance = cosine_distance(query, &entry.vector, query_norm);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((entry, distance)),
            }
        }

        Ok(best)
    }

    /// Produce an immutable point-in-time copy of all entries.
    pub fn export(&self) -> Snapshot {
        Snapshot {
            dimensions: self.dimensions,
            entries: self.entries.clone(),
        }
    }

    fn validate_vector(dimensions: usize, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                got: vector.len(),
            });
        }
        if l2_norm(vector) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(())
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine distance `1 - cos`, with the query norm precomputed.
fn cosine_distance(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 1.0;
    }

    let dot: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    1.0 - dot / (query_norm * target_norm)
}
