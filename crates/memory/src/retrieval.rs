//! Hybrid (vector + keyword) retrieval over the active fact set.
//!
//! Vector search runs only when the embedding model is ready and the
//! embedding circuit is closed; otherwise retrieval degrades to keyword-only,
//! never to "no results" — a slow or unloaded model should never silence
//! memory entirely.

use crate::decay::get_decay_status;
use crate::fact::Fact;
use crate::stopwords::{keyword_overlap_score, significant_words};
use crate::vector::cosine_similarity;
use chrono::{DateTime, Utc};

/// A fact ranked for injection into the prompt, carrying the score that
/// produced its position.
#[derive(Debug, Clone)]
pub struct RankedFact {
    pub fact: Fact,
    pub score: f32,
}

/// Below this cosine similarity a vector candidate is dropped outright
/// rather than merged in with a near-zero weight.
const VECTOR_MIN_SIMILARITY: f32 = 0.4;
const VECTOR_WEIGHT: f32 = 0.7;
const KEYWORD_WEIGHT: f32 = 0.3;

/// Vector-side candidate supplied by the caller (already joined against the
/// embeddings table — this module has no store dependency of its own).
pub struct VectorCandidate<'a> {
    pub fact: &'a Fact,
    pub embedding: &'a [f32],
}

/// Rank facts by hybrid similarity to `query`, applying per-stage decay
/// filtering (a fact whose [`crate::decay::DecayStatus::inject`] is false is
/// dropped before scoring) and returning at most `limit` results sorted by
/// descending score.
pub fn hybrid_search(
    query: &str,
    query_embedding: Option<&[f32]>,
    candidates: &[VectorCandidate<'_>],
    keyword_pool: &[&Fact],
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<RankedFact> {
    let query_words = significant_words(query);

    let mut scored: std::collections::HashMap<uuid::Uuid, (Fact, f32)> = std::collections::HashMap::new();

    if let Some(q_vec) = query_embedding {
        let top_n = limit.saturating_mul(2).max(1);
        let mut vector_hits: Vec<(Fact, f32)> = candidates
            .iter()
            .filter(|c| decay_allows(c.fact, now))
            .map(|c| (c.fact.clone(), cosine_similarity(q_vec, c.embedding)))
            .filter(|(_, sim)| *sim >= VECTOR_MIN_SIMILARITY)
            .collect();
        vector_hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        vector_hits.truncate(top_n);

        for (fact, sim) in vector_hits {
            let entry = scored.entry(fact.id).or_insert((fact, 0.0));
            entry.1 += VECTOR_WEIGHT * sim;
        }
    }

    for fact in keyword_pool.iter().filter(|f| decay_allows(f, now)) {
        let fact_words = significant_words(&fact.fact);
        let overlap = keyword_overlap_score(&query_words, &fact_words);
        if overlap <= 0.0 {
            continue;
        }
        let entry = scored.entry(fact.id).or_insert_with(|| ((*fact).clone(), 0.0));
        entry.1 += KEYWORD_WEIGHT * overlap;
    }

    let mut results: Vec<RankedFact> = scored
        .into_values()
        .map(|(fact, score)| RankedFact { fact, score })
        .collect();
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    results
}

fn decay_allows(fact: &Fact, now: DateTime<Utc>) -> bool {
    if fact.archived || fact.stale {
        return false;
    }
    get_decay_status(fact.last_confirmed_at, now).inject
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Confidence, Domain, Source};

    fn fact(text: &str) -> Fact {
        Fact::new(Domain::General, text, Confidence::Medium, "default", Source::Explicit, Utc::now())
    }

    #[test]
    fn keyword_only_search_ranks_by_overlap() {
        let a = fact("le gusta el cafe por la manana");
        let b = fact("trabaja en un proyecto de kubernetes");
        let pool = vec![&a, &b];
        let results = hybrid_search("cafe manana", None, &[], &pool, Utc::now(), 5);
        assert_eq!(results[0].fact.id, a.id);
    }

    #[test]
    fn vector_candidates_below_min_similarity_are_dropped() {
        let f = fact("algo irrelevante");
        let candidates = vec![VectorCandidate { fact: &f, embedding: &[1.0, 0.0] }];
        let query_vec = [0.0, 1.0];
        let results = hybrid_search("consulta", Some(&query_vec), &candidates, &[], Utc::now(), 5);
        assert!(results.is_empty());
    }

    #[test]
    fn stale_facts_are_excluded_from_results() {
        let mut f = fact("un dato antiguo");
        f.stale = true;
        let pool = vec![&f];
        let results = hybrid_search("dato antiguo", None, &[], &pool, Utc::now(), 5);
        assert!(results.is_empty());
    }

    #[test]
    fn results_are_capped_at_limit() {
        let facts: Vec<Fact> = (0..10).map(|i| fact(&format!("dato numero {i} sobre proyectos"))).collect();
        let pool: Vec<&Fact> = facts.iter().collect();
        let results = hybrid_search("proyectos", None, &[], &pool, Utc::now(), 3);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn vector_and_keyword_scores_combine_for_matching_fact() {
        let f = fact("le gusta el cafe");
        let candidates = vec![VectorCandidate { fact: &f, embedding: &[1.0, 0.0] }];
        let pool = vec![&f];
        let query_vec = [1.0, 0.0];
        let results = hybrid_search("cafe", Some(&query_vec), &candidates, &pool, Utc::now(), 5);
        assert_eq!(results.len(), 1);
        assert!(results[0].score > VECTOR_WEIGHT);
    }
}
