//! Semantic response cache.
//!
//! A hit requires all four of: query similarity above threshold, identical
//! retrieved-fact-set, identical system version, and a non-expired entry.
//! Any single mismatch is a miss — the four checks are not weighted against
//! each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::vector::cosine_similarity;

/// Similarity below which a cache candidate isn't even considered a
/// near-miss. Independent of [`CACHE_HIT_THRESHOLD`] — used only for
/// debug-level tuning telemetry.
pub const NEAR_MISS_LOG_THRESHOLD: f32 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Greeting,
    Tool,
    Factual,
}

impl QueryClass {
    pub fn ttl_seconds(self) -> i64 {
        match self {
            QueryClass::Greeting => 5 * 60,
            QueryClass::Tool => 60 * 60,
            QueryClass::Factual => 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheEntry {
    pub query_embedding: Vec<f32>,
    pub query_hash: String,
    pub fact_ids_hash: String,
    pub system_version: String,
    pub response: String,
    pub ttl_seconds: i64,
    pub created_at: DateTime<Utc>,
}

impl ResponseCacheEntry {
    pub fn new(
        query_embedding: Vec<f32>,
        query: &str,
        fact_ids: &[uuid::Uuid],
        system_version: impl Into<String>,
        response: impl Into<String>,
        class: QueryClass,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            query_embedding,
            query_hash: hash_str(query),
            fact_ids_hash: hash_fact_ids(fact_ids),
            system_version: system_version.into(),
            response: response.into(),
            ttl_seconds: class.ttl_seconds(),
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.created_at).num_seconds() >= self.ttl_seconds
    }
}

/// A candidate lookup's outcome: a confirmed hit, a logged near-miss (for
/// debug tuning only — never served as a response), or a plain miss.
pub enum Lookup<'a> {
    Hit(&'a ResponseCacheEntry),
    NearMiss { similarity: f32 },
    Miss,
}

pub fn hash_str(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Order-independent hash of a fact-id set, so retrieval returning the same
/// facts in a different order still counts as the same cache key component.
pub fn hash_fact_ids(ids: &[uuid::Uuid]) -> String {
    let mut sorted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    sorted.sort();
    hash_str(&sorted.join(","))
}

/// Look up a cache hit among `entries` for the given query embedding,
/// fact-id set, and system version. `hit_threshold` is the configured
/// `CACHE_SIMILARITY_THRESHOLD` (≈0.92).
pub fn lookup<'a>(
    entries: &'a [ResponseCacheEntry],
    query_embedding: &[f32],
    fact_ids: &[uuid::Uuid],
    system_version: &str,
    hit_threshold: f32,
    now: DateTime<Utc>,
) -> Lookup<'a> {
    let fact_hash = hash_fact_ids(fact_ids);
    let mut best_similarity = 0.0f32;

    for entry in entries {
        let similarity = cosine_similarity(&entry.query_embedding, query_embedding);
        best_similarity = best_similarity.max(similarity);

        if similarity < hit_threshold {
            continue;
        }
        if entry.fact_ids_hash != fact_hash {
            continue;
        }
        if entry.system_version != system_version {
            continue;
        }
        if entry.is_expired(now) {
            continue;
        }
        return Lookup::Hit(entry);
    }

    if best_similarity >= NEAR_MISS_LOG_THRESHOLD {
        Lookup::NearMiss { similarity: best_similarity }
    } else {
        Lookup::Miss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(embedding: Vec<f32>, fact_ids: &[uuid::Uuid], version: &str, now: DateTime<Utc>) -> ResponseCacheEntry {
        ResponseCacheEntry::new(embedding, "hola", fact_ids, version, "respuesta", QueryClass::Greeting, now)
    }

    #[test]
    fn exact_match_on_all_four_is_a_hit() {
        let now = Utc::now();
        let ids = vec![uuid::Uuid::new_v4()];
        let e = entry(vec![1.0, 0.0], &ids, "v1", now);
        let entries = vec![e];
        let result = lookup(&entries, &[1.0, 0.0], &ids, "v1", 0.92, now);
        assert!(matches!(result, Lookup::Hit(_)));
    }

    #[test]
    fn mismatched_fact_set_is_a_miss_despite_similarity() {
        let now = Utc::now();
        let ids = vec![uuid::Uuid::new_v4()];
        let other_ids = vec![uuid::Uuid::new_v4()];
        let e = entry(vec![1.0, 0.0], &ids, "v1", now);
        let entries = vec![e];
        let result = lookup(&entries, &[1.0, 0.0], &other_ids, "v1", 0.92, now);
        assert!(matches!(result, Lookup::Miss | Lookup::NearMiss { .. }));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let now = Utc::now();
        let ids = vec![uuid::Uuid::new_v4()];
        let mut e = entry(vec![1.0, 0.0], &ids, "v1", now - chrono::Duration::seconds(400));
        e.ttl_seconds = 300;
        let entries = vec![e];
        let result = lookup(&entries, &[1.0, 0.0], &ids, "v1", 0.92, now);
        assert!(matches!(result, Lookup::Miss));
    }

    #[test]
    fn system_version_mismatch_is_a_miss() {
        let now = Utc::now();
        let ids = vec![uuid::Uuid::new_v4()];
        let e = entry(vec![1.0, 0.0], &ids, "v1", now);
        let entries = vec![e];
        let result = lookup(&entries, &[1.0, 0.0], &ids, "v2", 0.92, now);
        assert!(matches!(result, Lookup::Miss | Lookup::NearMiss { .. }));
    }

    #[test]
    fn low_similarity_below_near_miss_threshold_is_plain_miss() {
        let now = Utc::now();
        let ids = vec![uuid::Uuid::new_v4()];
        let e = entry(vec![1.0, 0.0], &ids, "v1", now);
        let entries = vec![e];
        let result = lookup(&entries, &[0.0, 1.0], &ids, "v1", 0.92, now);
        assert!(matches!(result, Lookup::Miss));
    }

    #[test]
    fn ttl_seconds_match_class_defaults() {
        assert_eq!(QueryClass::Greeting.ttl_seconds(), 300);
        assert_eq!(QueryClass::Tool.ttl_seconds(), 3600);
        assert_eq!(QueryClass::Factual.ttl_seconds(), 86400);
    }

    #[test]
    fn fact_ids_hash_is_order_independent() {
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        assert_eq!(hash_fact_ids(&[a, b]), hash_fact_ids(&[b, a]));
    }
}
