//! Pending-extraction / pending-embedding queue rows.
//!
//! Both queues share the same row shape and the same crash-recovery rule: any
//! row left `Processing` at startup is reset to `Pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: Uuid,
    /// The fact or message id this row is about.
    pub subject_id: Uuid,
    /// For extraction rows, the source message text the model needs to see
    /// again on (re)processing. Unused by embedding rows, which re-read the
    /// fact straight from the store via `subject_id`.
    pub payload: Option<String>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueRow {
    pub fn new(subject_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id,
            payload: None,
            status: QueueStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Construct an extraction row carrying the source message text.
    pub fn new_with_payload(subject_id: Uuid, payload: impl Into<String>) -> Self {
        let mut row = Self::new(subject_id);
        row.payload = Some(payload.into());
        row
    }

    /// Backoff schedule in seconds indexed by attempt count, used by the
    /// extraction worker: `[0, 5, 30]`.
    pub fn extraction_backoff_secs(attempts: u32) -> i64 {
        match attempts {
            0 => 0,
            1 => 5,
            _ => 30,
        }
    }

    /// True if this row has waited out its backoff window since
    /// `last_attempt_at` and may be retried now.
    pub fn ready_for_retry(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt_at {
            None => true,
            Some(last) => {
                let wait = Self::extraction_backoff_secs(self.attempts);
                (now - last).num_seconds() >= wait
            }
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::Processing;
        self.last_attempt_at = Some(now);
        self.attempts += 1;
    }

    pub fn mark_completed(&mut self) {
        self.status = QueueStatus::Completed;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = if self.attempts >= 3 {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };
        self.last_error = Some(reason.into());
    }

    /// Crash recovery: any row observed `Processing` at startup did not
    /// survive to completion and is reset to `Pending`.
    pub fn recover_orphan(&mut self) {
        if self.status == QueueStatus::Processing {
            self.status = QueueStatus::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_processing_rows_reset_to_pending() {
        let mut row = QueueRow::new(Uuid::new_v4());
        row.status = QueueStatus::Processing;
        row.recover_orphan();
        assert_eq!(row.status, QueueStatus::Pending);
    }

    #[test]
    fn non_processing_rows_untouched_by_recovery() {
        let mut row = QueueRow::new(Uuid::new_v4());
        row.status = QueueStatus::Completed;
        row.recover_orphan();
        assert_eq!(row.status, QueueStatus::Completed);
    }

    #[test]
    fn backoff_schedule_matches_zero_five_thirty() {
        assert_eq!(QueueRow::extraction_backoff_secs(0), 0);
        assert_eq!(QueueRow::extraction_backoff_secs(1), 5);
        assert_eq!(QueueRow::extraction_backoff_secs(2), 30);
        assert_eq!(QueueRow::extraction_backoff_secs(10), 30);
    }

    #[test]
    fn fails_permanently_after_three_attempts() {
        let mut row = QueueRow::new(Uuid::new_v4());
        for _ in 0..3 {
            row.mark_processing(Utc::now());
            row.mark_failed("boom");
        }
        assert_eq!(row.status, QueueStatus::Failed);
    }

    #[test]
    fn ready_for_retry_without_prior_attempt() {
        let row = QueueRow::new(Uuid::new_v4());
        assert!(row.ready_for_retry(Utc::now()));
    }

    #[test]
    fn not_ready_for_retry_within_backoff_window() {
        let mut row = QueueRow::new(Uuid::new_v4());
        let now = Utc::now();
        row.mark_processing(now);
        row.mark_failed("boom");
        assert!(!row.ready_for_retry(now + chrono::Duration::seconds(2)));
        assert!(row.ready_for_retry(now + chrono::Duration::seconds(6)));
    }
}
