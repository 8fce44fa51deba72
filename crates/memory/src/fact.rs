//! The persisted `Fact` type and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Health,
    Preferences,
    Work,
    Relationships,
    Schedule,
    Goals,
    General,
    Decisions,
    Personal,
    Projects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Explicit,
    Inferred,
    Migrated,
}

pub const MAX_FACT_LEN: usize = 500;
pub const STALE_AGE_DAYS: i64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub domain: Domain,
    pub fact: String,
    pub confidence: Confidence,
    pub scope: String,
    pub source: Source,
    pub created_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub stale: bool,
    pub archived: bool,
    pub supersedes: Option<Uuid>,
}

impl Fact {
    /// Construct a new fact, truncating `fact` to [`MAX_FACT_LEN`] chars and
    /// stamping `created_at == last_confirmed_at == now`.
    pub fn new(
        domain: Domain,
        fact: impl Into<String>,
        confidence: Confidence,
        scope: impl Into<String>,
        source: Source,
        now: DateTime<Utc>,
    ) -> Self {
        let mut text = fact.into();
        if text.chars().count() > MAX_FACT_LEN {
            text = text.chars().take(MAX_FACT_LEN).collect();
        }
        Self {
            id: Uuid::new_v4(),
            domain,
            fact: text,
            confidence,
            scope: scope.into(),
            source,
            created_at: now,
            last_confirmed_at: now,
            stale: false,
            archived: false,
            supersedes: None,
        }
    }

    /// Re-mention bumps `last_confirmed_at` and clears `stale` — the fact is
    /// relevant again. Invariant: `last_confirmed_at >= created_at` always
    /// holds since `now` is monotonic wall-clock time at the caller.
    pub fn confirm(&mut self, now: DateTime<Utc>) {
        self.last_confirmed_at = now;
        self.stale = false;
    }

    pub fn is_active(&self) -> bool {
        !self.stale && !self.archived
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_confirmed_at).num_days().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact_at(now: DateTime<Utc>) -> Fact {
        Fact::new(
            Domain::Preferences,
            "likes oat milk",
            Confidence::High,
            "default".to_string(),
            Source::Explicit,
            now,
        )
    }

    #[test]
    fn new_fact_truncates_to_max_len() {
        let now = Utc::now();
        let long_text = "x".repeat(MAX_FACT_LEN + 50);
        let fact = Fact::new(
            Domain::General,
            long_text,
            Confidence::Low,
            "default",
            Source::Inferred,
            now,
        );
        assert_eq!(fact.fact.chars().count(), MAX_FACT_LEN);
    }

    #[test]
    fn confirm_clears_stale_and_bumps_timestamp() {
        let now = Utc::now();
        let mut fact = fact_at(now);
        fact.stale = true;
        let later = now + chrono::Duration::days(1);
        fact.confirm(later);
        assert!(!fact.stale);
        assert_eq!(fact.last_confirmed_at, later);
        assert!(fact.last_confirmed_at >= fact.created_at);
    }

    #[test]
    fn is_active_false_when_archived_or_stale() {
        let now = Utc::now();
        let mut fact = fact_at(now);
        assert!(fact.is_active());
        fact.archived = true;
        assert!(!fact.is_active());
        fact.archived = false;
        fact.stale = true;
        assert!(!fact.is_active());
    }
}
