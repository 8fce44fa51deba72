//! Resilience layer: health monitoring, a generic circuit breaker, and the
//! backoff schedule the router uses to throttle a failing classifier.
//!
//! None of this has a direct teacher analogue — the daemon/TUI backend this
//! runtime grew out of assumed a reliable local subprocess. Ported from the
//! same defensive-async idiom its own socket client used for reconnection:
//! `tokio::time::sleep` between attempts, state behind a `Mutex`, edge-triggered
//! logging on transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Rolling window of recent latency samples used to detect memory pressure.
const PRESSURE_WINDOW: usize = 10;
const MIN_SAMPLES_FOR_BASELINE: usize = 3;
const BASELINE_TRIM_SIGMA: f64 = 3.0;
const SPIKE_RATIO: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Available,
    Unavailable,
    MemoryPressure,
}

struct HealthState {
    last_check: Option<DateTime<Utc>>,
    availability: Availability,
    latencies: Vec<f64>,
    consecutive_spikes: u32,
}

/// Periodic health monitor for the local model backend. Staleness-aware:
/// `verify_available` only re-checks when the cached result has expired.
pub struct HealthMonitor {
    staleness: Duration,
    state: Mutex<HealthState>,
}

impl HealthMonitor {
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            state: Mutex::new(HealthState {
                last_check: None,
                availability: Availability::Unavailable,
                latencies: Vec::new(),
                consecutive_spikes: 0,
            }),
        }
    }

    /// Returns the cached availability if the last check is still fresh,
    /// otherwise re-runs `probe` and folds the result (and its latency) into
    /// the rolling window. Emits edge-triggered events via `on_event` only
    /// on a state transition.
    pub async fn verify_available<F, Fut>(
        &self,
        now: DateTime<Utc>,
        probe: F,
        mut on_event: impl FnMut(HealthEvent),
    ) -> Availability
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<Duration>>,
    {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_check {
            if (now - last).to_std().map(|d| d < self.staleness).unwrap_or(true) {
                return state.availability;
            }
        }

        let observed = probe().await;
        state.last_check = Some(now);
        let new_availability = match observed {
            Some(_) => Availability::Available,
            None => Availability::Unavailable,
        };

        if new_availability != state.availability {
            state.availability = new_availability;
            match new_availability {
                Availability::Available => on_event(HealthEvent::Available),
                Availability::Unavailable => on_event(HealthEvent::Unavailable),
            }
        }

        if let Some(latency) = observed {
            let latency_ms = latency.as_secs_f64() * 1000.0;
            if Self::record_latency(&mut state.latencies, &mut state.consecutive_spikes, latency_ms) {
                on_event(HealthEvent::MemoryPressure);
            }
        }

        state.availability
    }

    /// Push a latency sample into the rolling window and report whether this
    /// sample completes a second *consecutive* spike. Any non-spike sample
    /// resets the consecutive counter.
    fn record_latency(window: &mut Vec<f64>, consecutive_spikes: &mut u32, latency_ms: f64) -> bool {
        window.push(latency_ms);
        if window.len() > PRESSURE_WINDOW {
            window.remove(0);
        }
        if window.len() < MIN_SAMPLES_FOR_BASELINE {
            *consecutive_spikes = 0;
            return false;
        }

        let Some(baseline) = Self::baseline(window) else {
            *consecutive_spikes = 0;
            return false;
        };
        if baseline <= 0.0 {
            *consecutive_spikes = 0;
            return false;
        }

        let is_spike = latency_ms / baseline > SPIKE_RATIO;
        if is_spike {
            *consecutive_spikes += 1;
        } else {
            *consecutive_spikes = 0;
        }
        *consecutive_spikes >= 2
    }

    /// Baseline = median of the last 5 samples after trimming any sample
    /// ≥3σ from the mean.
    fn baseline(window: &[f64]) -> Option<f64> {
        let recent: Vec<f64> = window.iter().rev().take(5).copied().collect();
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let variance = recent.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / recent.len() as f64;
        let stddev = variance.sqrt();

        let mut trimmed: Vec<f64> = recent
            .into_iter()
            .filter(|x| stddev == 0.0 || (x - mean).abs() < BASELINE_TRIM_SIGMA * stddev)
            .collect();
        if trimmed.is_empty() {
            return None;
        }
        trimmed.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(trimmed[trimmed.len() / 2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
}

/// Generic three-state circuit breaker, one instance per guarded subsystem
/// (local executor, router classifier, embeddings).
pub struct CircuitBreaker {
    reset_timeout: Duration,
    failure_threshold: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            reset_timeout,
            failure_threshold,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Whether a call should be attempted right now. In the `Open` state this
    /// also performs the OPEN → HALF_OPEN transition once `reset_timeout`
    /// has elapsed.
    pub async fn should_allow(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed_ok = inner
                    .last_failure_time
                    .map(|t| (now - t).to_std().map(|d| d >= self.reset_timeout).unwrap_or(true))
                    .unwrap_or(true);
                if elapsed_ok {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    info!("circuit breaker: OPEN -> HALF_OPEN");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= 2 {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!("circuit breaker: HALF_OPEN -> CLOSED");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_time = Some(now);
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    warn!(failures = inner.failure_count, "circuit breaker: CLOSED -> OPEN");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.success_count = 0;
                warn!("circuit breaker: HALF_OPEN -> OPEN");
            }
            BreakerState::Open => {}
        }
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }
}

/// Router classifier backoff: after 3 consecutive failures, back off for
/// `30s * 2^(failures-3)` capped at 5 minutes. Every success resets.
pub struct ClassifierBackoff {
    consecutive_failures: Mutex<u32>,
    backing_off_until: Mutex<Option<DateTime<Utc>>>,
}

impl Default for ClassifierBackoff {
    fn default() -> Self {
        Self {
            consecutive_failures: Mutex::new(0),
            backing_off_until: Mutex::new(None),
        }
    }
}

impl ClassifierBackoff {
    pub async fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        match *self.backing_off_until.lock().await {
            Some(until) => now < until,
            None => false,
        }
    }

    pub async fn record_success(&self) {
        *self.consecutive_failures.lock().await = 0;
        *self.backing_off_until.lock().await = None;
    }

    pub async fn record_failure(&self, now: DateTime<Utc>) {
        let mut failures = self.consecutive_failures.lock().await;
        *failures += 1;
        if *failures >= 3 {
            let backoff_secs = 30u64.saturating_mul(1u64 << (*failures - 3).min(20));
            let capped = backoff_secs.min(300);
            *self.backing_off_until.lock().await = Some(now + chrono::Duration::seconds(capped as i64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure(now).await;
        }
        assert_eq!(breaker.snapshot().await.state, BreakerState::Open);
        assert!(!breaker.should_allow(now).await);
    }

    #[tokio::test]
    async fn breaker_half_opens_after_reset_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let now = Utc::now();
        breaker.record_failure(now).await;
        assert!(!breaker.should_allow(now).await);
        let later = now + chrono::Duration::seconds(61);
        assert!(breaker.should_allow(later).await);
        assert_eq!(breaker.snapshot().await.state, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn breaker_closes_after_two_half_open_successes() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let now = Utc::now();
        breaker.record_failure(now).await;
        breaker.should_allow(now + chrono::Duration::seconds(61)).await;
        breaker.record_success().await;
        breaker.record_success().await;
        assert_eq!(breaker.snapshot().await.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn breaker_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let now = Utc::now();
        breaker.record_failure(now).await;
        breaker.should_allow(now + chrono::Duration::seconds(61)).await;
        breaker.record_failure(now + chrono::Duration::seconds(61)).await;
        assert_eq!(breaker.snapshot().await.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn classifier_backoff_triggers_after_three_failures() {
        let backoff = ClassifierBackoff::default();
        let now = Utc::now();
        backoff.record_failure(now).await;
        backoff.record_failure(now).await;
        assert!(!backoff.is_backing_off(now).await);
        backoff.record_failure(now).await;
        assert!(backoff.is_backing_off(now).await);
    }

    #[tokio::test]
    async fn classifier_backoff_resets_on_success() {
        let backoff = ClassifierBackoff::default();
        let now = Utc::now();
        for _ in 0..3 {
            backoff.record_failure(now).await;
        }
        backoff.record_success().await;
        assert!(!backoff.is_backing_off(now).await);
    }

    #[tokio::test]
    async fn memory_pressure_requires_two_consecutive_spikes() {
        let monitor = HealthMonitor::new(Duration::from_secs(300));
        let mut window = Vec::new();
        let mut consecutive = 0;
        for _ in 0..5 {
            HealthMonitor::record_latency(&mut window, &mut consecutive, 100.0);
        }
        let first_spike = HealthMonitor::record_latency(&mut window, &mut consecutive, 400.0);
        assert!(!first_spike);
        let second_spike = HealthMonitor::record_latency(&mut window, &mut consecutive, 400.0);
        assert!(second_spike);
        let _ = monitor;
    }
}
