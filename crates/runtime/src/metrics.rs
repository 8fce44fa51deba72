//! Router metrics: per-tier counters, rolling averages, and a bounded P99
//! latency window, persisted with debounced writes.
//!
//! Grounded on the same `Mutex`-guarded-state-with-value-snapshot idiom as
//! [`crate::resilience::HealthMonitor`] — one mutex, snapshots returned by
//! value, no lock held across an await point.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::router::Tier;

/// Samples beyond this count are dropped oldest-first; bounds memory and
/// keeps the P99 computation cheap.
const LATENCY_WINDOW: usize = 100;

/// Minimum interval between persisted writes; a forced flush at shutdown
/// bypasses this.
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TierCounters {
    count: u64,
    total_latency_ms: u64,
    latencies_ms: Vec<u64>,
}

impl TierCounters {
    fn record(&mut self, latency_ms: u64) {
        self.count += 1;
        self.total_latency_ms += latency_ms;
        self.latencies_ms.push(latency_ms);
        if self.latencies_ms.len() > LATENCY_WINDOW {
            self.latencies_ms.remove(0);
        }
    }

    fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.count as f64
        }
    }

    fn p99_ms(&self) -> u64 {
        if self.latencies_ms.is_empty() {
            return 0;
        }
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSummary {
    pub count: u64,
    pub average_ms: f64,
    pub p99_ms: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub local_percentage: f64,
    pub deterministic_percentage: f64,
    pub api_percentage: f64,
    pub fallback_rate: f64,
    pub estimated_cost_savings: f64,
    pub tiers: HashMap<String, TierSummary>,
}

struct MetricsState {
    by_tier: HashMap<Tier, TierCounters>,
    fallbacks: u64,
    last_flush: Option<DateTime<Utc>>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self { by_tier: HashMap::new(), fallbacks: 0, last_flush: None }
    }
}

/// Per-turn router metrics, persisted with debounced writes (≥30s apart,
/// forced on shutdown). Cost per API call is a caller-supplied estimate in
/// USD cents so this module stays provider-agnostic.
pub struct RouterMetrics {
    state: Mutex<MetricsState>,
    cost_per_api_call_cents: f64,
}

impl RouterMetrics {
    pub fn new(cost_per_api_call_cents: f64) -> Self {
        Self { state: Mutex::new(MetricsState::default()), cost_per_api_call_cents }
    }

    pub async fn record(&self, tier: Tier, latency_ms: u64, was_fallback: bool) {
        let mut state = self.state.lock().await;
        state.by_tier.entry(tier).or_default().record(latency_ms);
        if was_fallback {
            state.fallbacks += 1;
        }
    }

    pub async fn summary(&self) -> MetricsSummary {
        let state = self.state.lock().await;
        let total: u64 = state.by_tier.values().map(|c| c.count).sum();
        let pct = |tier: Tier| -> f64 {
            let count = state.by_tier.get(&tier).map(|c| c.count).unwrap_or(0);
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64 * 100.0
            }
        };

        let non_api: u64 = state
            .by_tier
            .iter()
            .filter(|(tier, _)| **tier != Tier::Api)
            .map(|(_, counters)| counters.count)
            .sum();
        let estimated_cost_savings = non_api as f64 * self.cost_per_api_call_cents;

        let fallback_rate = if total == 0 { 0.0 } else { state.fallbacks as f64 / total as f64 };

        let tiers = state
            .by_tier
            .iter()
            .map(|(tier, counters)| {
                let label = format!("{tier:?}").to_lowercase();
                (
                    label,
                    TierSummary {
                        count: counters.count,
                        average_ms: counters.average_ms(),
                        p99_ms: counters.p99_ms(),
                        percentage: pct(*tier),
                    },
                )
            })
            .collect();

        MetricsSummary {
            local_percentage: pct(Tier::Local),
            deterministic_percentage: pct(Tier::Deterministic),
            api_percentage: pct(Tier::Api),
            fallback_rate,
            estimated_cost_savings,
            tiers,
        }
    }

    /// Whether a persisted write is due: at least [`FLUSH_DEBOUNCE`] since
    /// the last flush, or no flush has ever happened.
    pub async fn flush_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        match state.last_flush {
            None => true,
            Some(last) => (now - last).to_std().unwrap_or(Duration::ZERO) >= FLUSH_DEBOUNCE,
        }
    }

    pub async fn mark_flushed(&self, now: DateTime<Utc>) {
        self.state.lock().await.last_flush = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summary_computes_percentages_and_fallback_rate() {
        let metrics = RouterMetrics::new(2.0);
        metrics.record(Tier::Deterministic, 5, false).await;
        metrics.record(Tier::Local, 50, false).await;
        metrics.record(Tier::Api, 500, true).await;
        let summary = metrics.summary().await;
        assert!((summary.deterministic_percentage - 33.333).abs() < 0.1);
        assert!((summary.fallback_rate - (1.0 / 3.0)).abs() < 0.01);
        assert!(summary.estimated_cost_savings > 0.0);
    }

    #[tokio::test]
    async fn p99_tracks_bounded_window() {
        let metrics = RouterMetrics::new(0.0);
        for i in 0..150u64 {
            metrics.record(Tier::Api, i, false).await;
        }
        let summary = metrics.summary().await;
        let tier = summary.tiers.get("api").unwrap();
        assert_eq!(tier.count, 150);
        assert!(tier.p99_ms >= 100);
    }

    #[tokio::test]
    async fn flush_due_on_first_call_then_debounced() {
        let metrics = RouterMetrics::new(0.0);
        let now = Utc::now();
        assert!(metrics.flush_due(now).await);
        metrics.mark_flushed(now).await;
        assert!(!metrics.flush_due(now + chrono::Duration::seconds(5)).await);
        assert!(metrics.flush_due(now + chrono::Duration::seconds(31)).await);
    }
}
