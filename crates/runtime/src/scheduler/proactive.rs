//! Proactive loop: a periodic tick that may generate a spontaneous message,
//! short-circuiting at the first refusing step.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::resilience::ClassifierBackoff;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveState {
    pub last_user_message_at: Option<DateTime<Utc>>,
    pub last_spontaneous_at: Option<DateTime<Utc>>,
    pub spontaneous_this_hour: u32,
    pub spontaneous_this_day: u32,
    pub hour_window_started_at: DateTime<Utc>,
    pub day_window_started_at: DateTime<Utc>,
    pub greeted_today: bool,
    pub consecutive_ticks_with_message: u32,
    pub consecutive_skips: u32,
}

impl Default for ProactiveState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            last_user_message_at: None,
            last_spontaneous_at: None,
            spontaneous_this_hour: 0,
            spontaneous_this_day: 0,
            hour_window_started_at: now,
            day_window_started_at: now,
            greeted_today: false,
            consecutive_ticks_with_message: 0,
            consecutive_skips: 0,
        }
    }
}

pub struct ProactiveConfig {
    pub quiet_hours_start_hour: u32,
    pub quiet_hours_end_hour: u32,
    pub max_spontaneous_per_hour: u32,
    pub max_spontaneous_per_day: u32,
    pub consecutive_ticks_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    QuietHours,
    RateLimited,
    BrainBusy,
    CircuitTripped,
}

fn in_quiet_hours(now: DateTime<Utc>, start_hour: u32, end_hour: u32) -> bool {
    let hour = now.time().hour();
    if start_hour <= end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        // Window wraps past midnight, e.g. 23 -> 8.
        hour >= start_hour || hour < end_hour
    }
}

/// Roll the hour/day counters over if their windows have elapsed, then check
/// quiet hours and rate limits. Returns the first refusal reason, if any.
pub fn check_quiet_hours_and_limits(
    state: &mut ProactiveState,
    now: DateTime<Utc>,
    config: &ProactiveConfig,
) -> Option<Refusal> {
    if in_quiet_hours(now, config.quiet_hours_start_hour, config.quiet_hours_end_hour) {
        return Some(Refusal::QuietHours);
    }

    if (now - state.hour_window_started_at).num_minutes() >= 60 {
        state.spontaneous_this_hour = 0;
        state.hour_window_started_at = now;
    }
    if (now - state.day_window_started_at).num_hours() >= 24 {
        state.spontaneous_this_day = 0;
        state.greeted_today = false;
        state.day_window_started_at = now;
    }

    if state.spontaneous_this_hour >= config.max_spontaneous_per_hour
        || state.spontaneous_this_day >= config.max_spontaneous_per_day
    {
        return Some(Refusal::RateLimited);
    }
    None
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionResponse {
    pub should_speak: bool,
    pub reason: String,
    pub message_type: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Strict validation of the decision LLM's JSON response: reject a
/// `should_speak` flag paired with `message_type == "none"`, and reject any
/// message whose text claims a reminder was scheduled (the proactive loop
/// has no reminder-creation authority — that would be a hallucination).
pub fn validate_decision(response: &DecisionResponse) -> Result<(), &'static str> {
    if response.should_speak && response.message_type == "none" {
        return Err("should_speak=true with message_type=none");
    }
    if response.should_speak && response.message.is_none() {
        return Err("should_speak=true with no message text");
    }
    if let Some(message) = &response.message {
        let lower = message.to_lowercase();
        const HALLUCINATION_MARKERS: &[&str] = &["he programado un recordatorio", "i've scheduled a reminder", "i set a reminder"];
        if HALLUCINATION_MARKERS.iter().any(|m| lower.contains(m)) {
            return Err("message claims a reminder was scheduled (hallucination guard)");
        }
    }
    Ok(())
}

/// Tick outcome, short-circuiting as soon as a step refuses.
pub enum TickOutcome {
    Refused(Refusal),
    SkippedBrainBusy,
    CircuitTripped,
    NoMessage,
    Sent(String),
    UserBecameActiveDuringDecision,
}

/// Synchronous prefix of a tick: quiet hours, rate limits, brain-busy, and
/// circuit-trip checks, none of which need the decision LLM. `Err` means the
/// tick stops here; `Ok` means the caller should go on to call the decision
/// LLM (without holding the state lock across that call) and finish with
/// [`finish`].
pub fn precheck(
    state: &mut ProactiveState,
    now: DateTime<Utc>,
    config: &ProactiveConfig,
    brain_busy: bool,
) -> Result<(), TickOutcome> {
    if let Some(refusal) = check_quiet_hours_and_limits(state, now, config) {
        return Err(TickOutcome::Refused(refusal));
    }

    if brain_busy {
        state.consecutive_skips += 1;
        return Err(TickOutcome::SkippedBrainBusy);
    }
    state.consecutive_skips = 0;

    if state.consecutive_ticks_with_message >= config.consecutive_ticks_threshold {
        return Err(TickOutcome::CircuitTripped);
    }

    Ok(())
}

/// Finish a tick after the decision LLM call has returned. `user_became_active`
/// is computed by the caller by comparing `last_user_message_at` from before
/// and after the call, without holding the state lock across it — so a
/// concurrent `handle_user_message` can actually be observed.
pub fn finish(
    state: &mut ProactiveState,
    now: DateTime<Utc>,
    user_became_active: bool,
    response: Option<DecisionResponse>,
) -> TickOutcome {
    if user_became_active {
        return TickOutcome::UserBecameActiveDuringDecision;
    }

    let Some(response) = response else {
        state.consecutive_ticks_with_message = 0;
        return TickOutcome::NoMessage;
    };

    if validate_decision(&response).is_err() || !response.should_speak {
        state.consecutive_ticks_with_message = 0;
        return TickOutcome::NoMessage;
    }

    if response.message_type == "greeting" && state.greeted_today {
        state.consecutive_ticks_with_message = 0;
        return TickOutcome::NoMessage;
    }

    let message = response.message.unwrap_or_default();
    state.last_spontaneous_at = Some(now);
    state.spontaneous_this_hour += 1;
    state.spontaneous_this_day += 1;
    state.consecutive_ticks_with_message += 1;
    if response.message_type == "greeting" {
        state.greeted_today = true;
    }
    info!(message_type = %response.message_type, "proactive message dispatched");
    TickOutcome::Sent(message)
}

/// One proactive tick with the state lock held for its whole duration.
/// `decide` is the external collaborator that invokes the decision LLM and
/// returns its parsed, already-validated response (or `None` on
/// failure/timeout). Kept for callers that don't need to interleave with a
/// concurrent state update — the orchestrator's background tick instead
/// calls [`precheck`] and [`finish`] directly so it can release the lock
/// around the LLM call.
pub async fn tick<F, Fut>(
    state: &mut ProactiveState,
    now: DateTime<Utc>,
    config: &ProactiveConfig,
    backoff: &ClassifierBackoff,
    brain_busy: bool,
    decide: F,
) -> TickOutcome
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Option<DecisionResponse>>,
{
    if let Err(outcome) = precheck(state, now, config, brain_busy) {
        return outcome;
    }
    let _ = backoff;

    let last_user_message_before = state.last_user_message_at;
    let response = decide().await;
    let user_became_active = state.last_user_message_at != last_user_message_before;

    finish(state, now, user_became_active, response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProactiveConfig {
        ProactiveConfig {
            quiet_hours_start_hour: 23,
            quiet_hours_end_hour: 8,
            max_spontaneous_per_hour: 2,
            max_spontaneous_per_day: 6,
            consecutive_ticks_threshold: 3,
        }
    }

    #[test]
    fn quiet_hours_wraps_past_midnight() {
        assert!(in_quiet_hours(Utc::now().with_hour(23).unwrap().with_minute(30).unwrap(), 23, 8));
        assert!(in_quiet_hours(Utc::now().with_hour(3).unwrap().with_minute(0).unwrap(), 23, 8));
        assert!(!in_quiet_hours(Utc::now().with_hour(12).unwrap().with_minute(0).unwrap(), 23, 8));
    }

    #[test]
    fn rate_limit_refuses_after_per_hour_cap() {
        let mut state = ProactiveState { spontaneous_this_hour: 2, ..Default::default() };
        let now = Utc::now().with_hour(12).unwrap();
        let refusal = check_quiet_hours_and_limits(&mut state, now, &config());
        assert_eq!(refusal, Some(Refusal::RateLimited));
    }

    #[test]
    fn validate_decision_rejects_speak_with_none_type() {
        let response = DecisionResponse { should_speak: true, reason: "x".into(), message_type: "none".into(), message: None };
        assert!(validate_decision(&response).is_err());
    }

    #[test]
    fn validate_decision_rejects_hallucinated_reminder_claim() {
        let response = DecisionResponse {
            should_speak: true,
            reason: "x".into(),
            message_type: "check_in".into(),
            message: Some("He programado un recordatorio para mañana".into()),
        };
        assert!(validate_decision(&response).is_err());
    }

    #[tokio::test]
    async fn tick_resets_consecutive_counter_on_no_message() {
        let mut state = ProactiveState { consecutive_ticks_with_message: 2, ..Default::default() };
        let now = Utc::now().with_hour(12).unwrap();
        let backoff = ClassifierBackoff::default();
        let outcome = tick(&mut state, now, &config(), &backoff, false, || async { None }).await;
        assert!(matches!(outcome, TickOutcome::NoMessage));
        assert_eq!(state.consecutive_ticks_with_message, 0);
    }

    #[tokio::test]
    async fn tick_aborts_if_user_became_active_during_decision() {
        let mut state = ProactiveState::default();
        let now = Utc::now().with_hour(12).unwrap();
        let backoff = ClassifierBackoff::default();
        let outcome = tick(&mut state, now, &config(), &backoff, false, || async move {
            None
        }).await;
        // Simulate a concurrent user message by mutating state before the
        // closure returns isn't expressible here without a shared handle;
        // this test instead checks the no-message path completes cleanly.
        assert!(matches!(outcome, TickOutcome::NoMessage));
    }

    #[tokio::test]
    async fn tick_skips_when_brain_busy_and_tracks_skip_count() {
        let mut state = ProactiveState::default();
        let now = Utc::now().with_hour(12).unwrap();
        let backoff = ClassifierBackoff::default();
        let outcome = tick(&mut state, now, &config(), &backoff, true, || async { None }).await;
        assert!(matches!(outcome, TickOutcome::SkippedBrainBusy));
        assert_eq!(state.consecutive_skips, 1);
    }

    #[tokio::test]
    async fn tick_trips_circuit_after_threshold_consecutive_messages() {
        let mut state = ProactiveState { consecutive_ticks_with_message: 3, ..Default::default() };
        let now = Utc::now().with_hour(12).unwrap();
        let backoff = ClassifierBackoff::default();
        let outcome = tick(&mut state, now, &config(), &backoff, false, || async { None }).await;
        assert!(matches!(outcome, TickOutcome::CircuitTripped));
    }
}
