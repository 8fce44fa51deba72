//! Embedding model lifecycle and the background embedding worker.
//!
//! The model itself (e.g. a candle-loaded sentence-transformer) is an
//! external collaborator — this module owns only the lazy-load/backoff
//! state machine and the worker tick, matching the "resource ownership of
//! the embedding pipeline" re-architecture note: this module exclusively
//! owns the pipeline handle, and `dispose` guarantees release on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::fact::Fact;
use crate::queue::QueueRow;
use crate::store::{FactStore, QueueTable, StoredEmbedding};
use crate::vector::normalize;

/// External collaborator: turns text into a fixed-dim embedding. Implemented
/// by whatever local inference backend is wired in at startup.
#[async_trait::async_trait]
pub trait EmbedFn: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn model_version(&self) -> &str;
}

const MAX_LOAD_ATTEMPTS: u32 = 3;
const WORKER_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    NotLoaded,
    Loading,
    Ready,
    Failed,
}

/// Tracks lazy-load state and exponential backoff for the underlying model.
/// `5s * 2^n`, capped, up to [`MAX_LOAD_ATTEMPTS`] attempts.
pub struct EmbeddingModelHandle {
    state: Mutex<LoadState>,
    attempts: Mutex<u32>,
}

impl Default for EmbeddingModelHandle {
    fn default() -> Self {
        Self {
            state: Mutex::new(LoadState::NotLoaded),
            attempts: Mutex::new(0),
        }
    }
}

impl EmbeddingModelHandle {
    /// Ensure the model is ready, loading it on first use. Returns an error
    /// after [`MAX_LOAD_ATTEMPTS`] failed attempts; callers should treat this
    /// as `Unavailable` and fall back to keyword-only retrieval.
    #[instrument(skip(self, loader))]
    pub async fn ensure_ready<F, Fut>(&self, loader: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        {
            let state = self.state.lock().await;
            if *state == LoadState::Ready {
                return Ok(());
            }
            if *state == LoadState::Failed {
                bail!("embedding model failed to load after {MAX_LOAD_ATTEMPTS} attempts");
            }
        }

        *self.state.lock().await = LoadState::Loading;
        info!("downloading/loading embedding model…");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match loader().await {
                Ok(()) => {
                    *self.state.lock().await = LoadState::Ready;
                    return Ok(());
                }
                Err(err) if attempt < MAX_LOAD_ATTEMPTS => {
                    let backoff = Duration::from_secs(5u64.saturating_mul(1 << (attempt - 1)));
                    warn!(?err, attempt, backoff_secs = backoff.as_secs(), "embedding model load failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    *self.state.lock().await = LoadState::Failed;
                    *self.attempts.lock().await = attempt;
                    return Err(err);
                }
            }
        }
    }

    pub async fn is_ready(&self) -> bool {
        *self.state.lock().await == LoadState::Ready
    }
}

/// Background worker: ticks every 10s, single-flight, processes up to
/// [`WORKER_BATCH_SIZE`] pending-embedding rows per tick.
pub struct EmbeddingWorker {
    store: Arc<Mutex<FactStore>>,
    embed_fn: Arc<dyn EmbedFn>,
    processing_lock: Mutex<()>,
}

impl EmbeddingWorker {
    pub fn new(store: Arc<Mutex<FactStore>>, embed_fn: Arc<dyn EmbedFn>) -> Self {
        Self { store, embed_fn, processing_lock: Mutex::new(()) }
    }

    /// One tick: attempt to acquire the single-flight lock (no-op if busy),
    /// then process up to [`WORKER_BATCH_SIZE`] pending rows.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize> {
        let Ok(_guard) = self.processing_lock.try_lock() else {
            return Ok(0);
        };

        let now = chrono::Utc::now();
        let rows = {
            let store = self.store.lock().await;
            store.pending_rows(QueueTable::Embedding, WORKER_BATCH_SIZE, now)?
        };

        let mut processed = 0;
        for mut row in rows {
            let result = self.process_row(&mut row).await;
            let mut store = self.store.lock().await;
            match result {
                Ok(()) => {
                    row.mark_completed();
                    processed += 1;
                }
                Err(err) => {
                    row.mark_failed(err.to_string());
                }
            }
            store.update_row(QueueTable::Embedding, &row)?;
        }
        Ok(processed)
    }

    async fn process_row(&self, row: &mut QueueRow) -> Result<()> {
        row.mark_processing(chrono::Utc::now());

        let fact: Option<Fact> = {
            let store = self.store.lock().await;
            store.get(row.subject_id).cloned()
        };
        let Some(fact) = fact else {
            // Fact was deleted before its embedding was computed — mark
            // completed rather than retrying forever.
            return Ok(());
        };

        let mut vector = self.embed_fn.embed(&fact.fact).await?;
        normalize(&mut vector);

        let store = self.store.lock().await;
        store.put_embedding(&StoredEmbedding {
            fact_id: fact.id,
            model_version: self.embed_fn.model_version().to_string(),
            vector,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Confidence, Domain, Source};
    use crate::store::FactStore;

    struct StubEmbedder {
        version: String,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl EmbedFn for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.fail {
                bail!("stub embedder configured to fail");
            }
            Ok(vec![text.len() as f32, 1.0, 0.0])
        }
        fn model_version(&self) -> &str {
            &self.version
        }
    }

    fn temp_store() -> (tempfile::TempDir, Arc<Mutex<FactStore>>) {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path().join("facts.redb")).unwrap();
        (dir, Arc::new(Mutex::new(store)))
    }

    #[tokio::test]
    async fn ensure_ready_succeeds_on_first_try() {
        let handle = EmbeddingModelHandle::default();
        handle.ensure_ready(|| async { Ok(()) }).await.unwrap();
        assert!(handle.is_ready().await);
    }

    #[tokio::test]
    async fn ensure_ready_fails_after_max_attempts() {
        let handle = EmbeddingModelHandle::default();
        let result = handle
            .ensure_ready(|| async { bail!("network down") })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn worker_processes_pending_row_and_marks_completed() {
        let (_dir, store) = temp_store();
        let fact_id;
        {
            let mut guard = store.lock().await;
            let fact = Fact::new(Domain::General, "test fact", Confidence::Medium, "default", Source::Explicit, chrono::Utc::now());
            fact_id = guard.insert(fact, |_| false).unwrap();
            guard.enqueue(QueueTable::Embedding, &QueueRow::new(fact_id)).unwrap();
        }

        let embedder = Arc::new(StubEmbedder { version: "v1".to_string(), fail: false });
        let worker = EmbeddingWorker::new(store.clone(), embedder);
        let processed = worker.tick().await.unwrap();
        assert_eq!(processed, 1);

        let guard = store.lock().await;
        assert!(guard.get_embedding(fact_id, "v1").unwrap().is_some());
    }

    #[tokio::test]
    async fn worker_marks_completed_when_fact_deleted() {
        let (_dir, store) = temp_store();
        let missing_id = uuid::Uuid::new_v4();
        {
            let guard = store.lock().await;
            guard.enqueue(QueueTable::Embedding, &QueueRow::new(missing_id)).unwrap();
        }
        let embedder = Arc::new(StubEmbedder { version: "v1".to_string(), fail: false });
        let worker = EmbeddingWorker::new(store.clone(), embedder);
        let processed = worker.tick().await.unwrap();
        assert_eq!(processed, 1);
    }
}
