//! Model Lifecycle Manager: keeps the classifier warm, loads productivity
//! models on demand, evicts under memory pressure.
//!
//! Single-flight load coalescing mirrors the same pattern used by
//! [`crate::resilience::CircuitBreaker`] — state behind a `Mutex`, callers
//! await the in-flight future rather than duplicating work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

/// Estimated RAM footprint by parameter-count size suffix, in megabytes.
fn estimated_footprint_mb(model: &str) -> u64 {
    let lower = model.to_lowercase();
    if lower.contains("70b") {
        45_000
    } else if lower.contains("13b") {
        9_000
    } else if lower.contains("7b") {
        5_000
    } else if lower.contains("3b") {
        2_000
    } else {
        2_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Loading,
    Loaded,
}

struct ModelEntry {
    state: LoadState,
    refcount: u32,
    footprint_mb: u64,
    is_classifier: bool,
}

/// External collaborator: issues the minimal warm request (predict a single
/// token) against the local model server.
#[async_trait::async_trait]
pub trait WarmFn: Send + Sync {
    async fn warm(&self, model: &str) -> Result<()>;
}

/// External collaborator: reports currently available system RAM in MB.
pub trait AvailableRam: Send + Sync {
    fn available_mb(&self) -> u64;
}

pub struct ModelLifecycleManager {
    warm_fn: Arc<dyn WarmFn>,
    ram: Arc<dyn AvailableRam>,
    entries: Mutex<HashMap<String, ModelEntry>>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
    preload_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModelLifecycleManager {
    pub fn new(warm_fn: Arc<dyn WarmFn>, ram: Arc<dyn AvailableRam>) -> Self {
        Self {
            warm_fn,
            ram,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            preload_timer: Mutex::new(None),
        }
    }

    fn normalize(model: &str) -> String {
        model.trim().to_lowercase()
    }

    /// Ensure `model` is loaded, coalescing concurrent callers for the same
    /// normalized name through a single in-flight load.
    pub async fn ensure_loaded(&self, model: &str, is_classifier: bool) -> Result<()> {
        let key = Self::normalize(model);

        {
            let entries = self.entries.lock().await;
            if matches!(entries.get(&key), Some(e) if e.state == LoadState::Loaded) {
                return Ok(());
            }
        }

        let notify = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                Some(existing.clone())
            } else {
                let notify = Arc::new(Notify::new());
                in_flight.insert(key.clone(), notify);
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            let entries = self.entries.lock().await;
            return if matches!(entries.get(&key), Some(e) if e.state == LoadState::Loaded) {
                Ok(())
            } else {
                bail!("model {key} failed to load (coalesced caller)")
            };
        }

        let result = self.load_inner(&key, is_classifier).await;

        let mut in_flight = self.in_flight.lock().await;
        if let Some(notify) = in_flight.remove(&key) {
            notify.notify_waiters();
        }
        result
    }

    async fn load_inner(&self, key: &str, is_classifier: bool) -> Result<()> {
        let footprint = estimated_footprint_mb(key);
        if self.ram.available_mb() < footprint {
            self.evict_for_space(footprint).await;
        }

        self.warm_fn.warm(key).await?;

        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            ModelEntry { state: LoadState::Loaded, refcount: 0, footprint_mb: footprint, is_classifier },
        );
        info!(model = key, footprint_mb = footprint, "model warmed");
        Ok(())
    }

    /// Evict non-classifier models with zero locks, largest-footprint first,
    /// until `needed_mb` is likely available.
    async fn evict_for_space(&self, needed_mb: u64) {
        let mut entries = self.entries.lock().await;
        let mut candidates: Vec<(String, u64)> = entries
            .iter()
            .filter(|(_, e)| !e.is_classifier && e.refcount == 0 && e.state == LoadState::Loaded)
            .map(|(k, e)| (k.clone(), e.footprint_mb))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut freed = 0u64;
        for (key, footprint) in candidates {
            if freed >= needed_mb {
                break;
            }
            entries.remove(&key);
            freed += footprint;
            warn!(model = key, "evicted to free memory");
        }
    }

    /// Increment a per-model refcount; the returned guard decrements on
    /// drop. `unload_non_essential` refuses to evict a locked model.
    pub async fn acquire_lock(self: &Arc<Self>, model: &str) -> ModelLockGuard {
        let key = Self::normalize(model);
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(&key) {
                entry.refcount += 1;
            }
        }
        ModelLockGuard { manager: Arc::clone(self), key }
    }

    async fn release_lock(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }

    /// Pressure-driven eviction: unload every loaded model except the
    /// classifier, refusing any with an active lock.
    pub async fn unload_non_essential(&self) {
        let mut entries = self.entries.lock().await;
        let to_remove: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !e.is_classifier && e.refcount == 0)
            .map(|(k, _)| k.clone())
            .collect();
        for key in to_remove {
            entries.remove(&key);
            info!(model = key, "unloaded (non-essential, pressure-driven)");
        }
    }

    /// Single debounced background preload timer: scheduling again replaces
    /// the pending one.
    pub async fn schedule_background_preload(self: &Arc<Self>, model: String, delay: Duration) {
        let mut timer = self.preload_timer.lock().await;
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let manager = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let key = ModelLifecycleManager::normalize(&model);
            let already_loaded = {
                let entries = manager.entries.lock().await;
                matches!(entries.get(&key), Some(e) if e.state == LoadState::Loaded)
            };
            if !already_loaded {
                let _ = manager.ensure_loaded(&model, false).await;
            }
        }));
    }

    pub async fn is_loaded(&self, model: &str) -> bool {
        let key = Self::normalize(model);
        let entries = self.entries.lock().await;
        matches!(entries.get(&key), Some(e) if e.state == LoadState::Loaded)
    }
}

pub struct ModelLockGuard {
    manager: Arc<ModelLifecycleManager>,
    key: String,
}

impl Drop for ModelLockGuard {
    fn drop(&mut self) {
        let manager = Arc::clone(&self.manager);
        let key = std::mem::take(&mut self.key);
        // `Drop` can't be async; detach the refcount release onto the
        // runtime instead. The held `Arc` keeps the manager alive for it.
        tokio::spawn(async move {
            manager.release_lock(&key).await;
        });
    }
}

/// Pick the first installed (and, if `require_loaded`, loaded) model from
/// `intent_preference`, falling back to `device_recommended`.
pub async fn select_model_for_intent(
    manager: &ModelLifecycleManager,
    intent_preference: &[String],
    device_recommended: &[String],
    installed: &[String],
    require_loaded: bool,
) -> Option<String> {
    for candidate in intent_preference.iter().chain(device_recommended.iter()) {
        if !installed.iter().any(|m| m == candidate) {
            continue;
        }
        if require_loaded && !manager.is_loaded(candidate).await {
            continue;
        }
        return Some(candidate.clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubWarm(AtomicU32);
    #[async_trait::async_trait]
    impl WarmFn for StubWarm {
        async fn warm(&self, _model: &str) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PlentyRam;
    impl AvailableRam for PlentyRam {
        fn available_mb(&self) -> u64 {
            64_000
        }
    }

    #[tokio::test]
    async fn ensure_loaded_warms_once() {
        let warm = Arc::new(StubWarm(AtomicU32::new(0)));
        let manager = ModelLifecycleManager::new(warm.clone(), Arc::new(PlentyRam));
        manager.ensure_loaded("llama3:8b", false).await.unwrap();
        assert!(manager.is_loaded("llama3:8b").await);
        manager.ensure_loaded("LLAMA3:8B", false).await.unwrap();
        assert_eq!(warm.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unload_non_essential_keeps_classifier() {
        let warm = Arc::new(StubWarm(AtomicU32::new(0)));
        let manager = ModelLifecycleManager::new(warm, Arc::new(PlentyRam));
        manager.ensure_loaded("classifier:1b", true).await.unwrap();
        manager.ensure_loaded("big:13b", false).await.unwrap();
        manager.unload_non_essential().await;
        assert!(manager.is_loaded("classifier:1b").await);
        assert!(!manager.is_loaded("big:13b").await);
    }

    #[test]
    fn footprint_estimates_match_size_suffix_table() {
        assert_eq!(estimated_footprint_mb("llama3:3b"), 2_000);
        assert_eq!(estimated_footprint_mb("llama3:7b"), 5_000);
        assert_eq!(estimated_footprint_mb("llama3:13b"), 9_000);
        assert_eq!(estimated_footprint_mb("llama3:70b"), 45_000);
    }

    #[tokio::test]
    async fn select_model_picks_first_installed() {
        let installed = vec!["model-b".to_string()];
        let preference = vec!["model-a".to_string(), "model-b".to_string()];
        let warm = Arc::new(StubWarm(AtomicU32::new(0)));
        let manager = ModelLifecycleManager::new(warm, Arc::new(PlentyRam));
        let chosen = select_model_for_intent(&manager, &preference, &[], &installed, false).await;
        assert_eq!(chosen, Some("model-b".to_string()));
    }
}
