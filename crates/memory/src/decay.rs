//! Decay status: a pure function of age, never stored.
//!
//! Kept as a leaf module with no dependency on the fact store or the decay
//! service, breaking the cyclic dependency the source exhibited between
//! knowledge, the facts store, and decay (see the re-architecture notes).

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayStage {
    Fresh,
    Aging,
    LowPriority,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayStatus {
    pub inject: bool,
    pub relevance_threshold: f32,
    pub stage: DecayStage,
}

/// Batch size for the paginated decay scan, with a yield between batches so
/// the scan never blocks the async runtime for long.
pub const DECAY_SCAN_BATCH_SIZE: usize = 100;

/// Compute [`DecayStatus`] purely from `last_confirmed_at` age in days.
pub fn get_decay_status(last_confirmed_at: DateTime<Utc>, now: DateTime<Utc>) -> DecayStatus {
    let age_days = (now - last_confirmed_at).num_days().max(0);
    match age_days {
        0..=59 => DecayStatus {
            inject: true,
            relevance_threshold: 0.0,
            stage: DecayStage::Fresh,
        },
        60..=89 => DecayStatus {
            inject: true,
            relevance_threshold: 0.3,
            stage: DecayStage::Aging,
        },
        90..=119 => DecayStatus {
            inject: true,
            relevance_threshold: 0.7,
            stage: DecayStage::LowPriority,
        },
        _ => DecayStatus {
            inject: false,
            relevance_threshold: 1.0,
            stage: DecayStage::Stale,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn status_for_days_ago(days: i64) -> DecayStatus {
        let now = Utc::now();
        get_decay_status(now - Duration::days(days), now)
    }

    #[test]
    fn fresh_bucket_boundaries() {
        assert_eq!(status_for_days_ago(0).stage, DecayStage::Fresh);
        assert_eq!(status_for_days_ago(59).stage, DecayStage::Fresh);
    }

    #[test]
    fn aging_bucket_boundaries() {
        assert_eq!(status_for_days_ago(60).stage, DecayStage::Aging);
        assert_eq!(status_for_days_ago(89).stage, DecayStage::Aging);
    }

    #[test]
    fn low_priority_bucket_boundaries() {
        assert_eq!(status_for_days_ago(90).stage, DecayStage::LowPriority);
        assert_eq!(status_for_days_ago(119).stage, DecayStage::LowPriority);
    }

    #[test]
    fn stale_from_120_days_and_never_injected() {
        let status = status_for_days_ago(120);
        assert_eq!(status.stage, DecayStage::Stale);
        assert!(!status.inject);

        let very_old = status_for_days_ago(900);
        assert_eq!(very_old.stage, DecayStage::Stale);
    }

    #[test]
    fn fresh_entries_always_inject() {
        assert!(status_for_days_ago(0).inject);
        assert!(status_for_days_ago(59).inject);
    }
}
