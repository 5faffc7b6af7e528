//! Near-duplicate detection service.
//!
//! Orchestrates embedding, nearest-neighbor lookup, admission and the
//! write-back flush policy. Embedding runs outside the critical section;
//! the query+insert+counter step is one exclusive section; persistence I/O
//! happens outside the lock on an exported copy.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::eid::Eid;
use crate::embedding::{preprocess_text, EmbeddingError, EmbeddingProvider};
use crate::flush::FlushController;
use crate::index::{IndexError, VectorIndex};
use crate::snapshot::{SnapshotError, SnapshotStore};

/// Errors surfaced by the dedup service.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("corrupt or unreadable snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("snapshot dimension {snapshot} does not match embedding model dimension {model}")]
    StartupDimensionMismatch { snapshot: usize, model: usize },

    #[error("input text is empty")]
    EmptyInput,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of submitting a text.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// A sufficiently similar text already exists; nothing was admitted.
    Duplicate { matched_text: String, distance: f32 },
    /// The text was admitted as a new entry.
    Admitted { id: Eid },
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceStats {
    pub entries: usize,
    pub pending: u64,
    pub dimensions: usize,
}

/// Tunables for the service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    /// Duplicate iff cosine distance to the nearest entry is strictly
    /// below this value.
    pub similarity_threshold: f32,
    pub batch_size: u64,
    pub flush_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            batch_size: 100,
            flush_interval: Duration::from_secs(300),
        }
    }
}

/// Everything guarded by the exclusive critical section.
struct Inner {
    index: VectorIndex,
    flush: FlushController,
    /// Set while an exported snapshot is being persisted outside the lock,
    /// so concurrent admissions do not start a second flush.
    flush_in_flight: bool,
}

/// Shared dedup service: one index, one flush controller, many submitters.
pub struct DedupService {
    provider: Arc<dyn EmbeddingProvider>,
    store: SnapshotStore,
    model_id: [u8; 32],
    threshold: f32,
    inner: Mutex<Inner>,
    /// Signalled whenever `flush_in_flight` is cleared.
    flush_settled: Condvar,
}

impl DedupService {
    /// Load the last snapshot (or start empty) and build the service.
    ///
    /// Fails on a corrupt snapshot or when the snapshot's dimension
    /// disagrees with the provider's; the service must not start with
    /// unverifiable state.
    pub fn open(
        provider: Arc<dyn EmbeddingProvider>,
        store: SnapshotStore,
        opts: ServiceOptions,
    ) -> Result<Self, DedupError> {
        let model_id = provider.model_id();

        let index = if store.exists() {
            let snapshot = store.load(&model_id)?;
            let index = VectorIndex::from_snapshot(snapshot)?;
            if index.dimensions() != provider.dimensions() {
                return Err(DedupError::StartupDimensionMismatch {
                    snapshot: index.dimensions(),
                    model: provider.dimensions(),
                });
            }
            log::info!(
                "loaded {} entries from {}",
                index.len(),
                store.path().display()
            );
            index
        } else {
            log::info!("no snapshot at {}, starting empty", store.path().display());
            VectorIndex::new(provider.dimensions())
        };

        Ok(Self {
            provider,
            store,
            model_id,
            threshold: opts.similarity_threshold,
            inner: Mutex::new(Inner {
                index,
                flush: FlushController::new(opts.batch_size, opts.flush_interval),
                flush_in_flight: false,
            }),
            flush_settled: Condvar::new(),
        })
    }

    /// Submit a text: detect a near-duplicate or admit it.
    ///
    /// Duplicate iff the nearest cosine distance is strictly below the
    /// configured threshold. Admission never fails because of persistence;
    /// a failed flush only degrades durability.
    pub fn submit(&self, text: &str) -> Result<SubmitOutcome, DedupError> {
        let content = preprocess_text(text).ok_or(DedupError::EmptyInput)?;

        // Provider call is slow and cancellable; keep it outside the lock.
        // Failing here leaves the index and counters untouched.
        let vector = self.provider.embed(&content)?;

        let (outcome, due) = {
            let mut inner = self.lock_inner()?;

            if let Some((entry, distance)) = inner.index.nearest(&vector)? {
                if distance < self.threshold {
                    log::debug!("duplicate of seq {} at distance {distance}", entry.seq);
                    return Ok(SubmitOutcome::Duplicate {
                        matched_text: entry.text.clone(),
                        distance,
                    });
                }
            }

            let id = inner.index.insert(vector, content)?.id.clone();
            inner.flush.record_admission();

            let due = inner.flush.is_due(Instant::now()) && !inner.flush_in_flight;
            if due {
                inner.flush_in_flight = true;
            }

            (SubmitOutcome::Admitted { id }, due)
        };

        if due {
            if let Err(err) = self.flush_exported() {
                log::warn!("flush failed, will retry on next admission: {err}");
            }
        }

        Ok(outcome)
    }

    /// Export under the lock, persist outside it, then settle the counters.
    ///
    /// Caller must have set `flush_in_flight`; it is cleared on every exit
    /// path. On failure the flush state is left untouched so the next
    /// admission re-attempts.
    fn flush_exported(&self) -> Result<(), DedupError> {
        let (snapshot, exported_pending) = {
            let inner = self.lock_inner()?;
            (inner.index.export(), inner.flush.pending())
        };

        let saved = self.store.save(&snapshot, &self.model_id);

        let mut inner = self.lock_inner()?;
        inner.flush_in_flight = false;
        self.flush_settled.notify_all();
        match saved {
            Ok(()) => {
                inner.flush.complete(exported_pending, Instant::now());
                log::info!(
                    "flushed {} entries ({} admissions) to {}",
                    snapshot.entries.len(),
                    exported_pending,
                    self.store.path().display()
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Final flush on graceful shutdown, regardless of triggers.
    ///
    /// Failure is logged but never prevents shutdown from completing.
    pub fn shutdown(&self) {
        let pending = {
            let mut inner = match self.lock_inner() {
                Ok(inner) => inner,
                Err(err) => {
                    log::error!("shutdown: {err}");
                    return;
                }
            };

            // wait out a flush another submit started; two concurrent saves
            // would race on the same temp file
            while inner.flush_in_flight {
                log::warn!("shutdown waiting for an in-flight flush to settle");
                inner = match self.flush_settled.wait(inner) {
                    Ok(inner) => inner,
                    Err(err) => {
                        log::error!("shutdown: lock poisoned: {err}");
                        return;
                    }
                };
            }

            if inner.flush.pending() == 0 {
                log::info!("shutdown with nothing pending");
                return;
            }

            inner.flush_in_flight = true;
            inner.flush.pending()
        };

        match self.flush_exported() {
            Ok(()) => log::info!("final flush persisted {pending} pending admissions"),
            Err(err) => log::error!("final flush failed, {pending} admissions lost: {err}"),
        }
    }

    pub fn stats(&self) -> Result<ServiceStats, DedupError> {
        let inner = self.lock_inner()?;
        Ok(ServiceStats {
            entries: inner.index.len(),
            pending: inner.flush.pending(),
            dimensions: inner.index.dimensions(),
        })
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, Inner>, DedupError> {
        self.inner
            .lock()
            .map_err(|e| DedupError::Internal(format!("lock poisoned: {}", e)))
    }
}
