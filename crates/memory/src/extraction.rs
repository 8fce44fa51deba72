//! LLM-driven fact extraction worker.
//!
//! Every model response is treated as untrusted input: each element of the
//! extracted array is independently validated and accepted or dropped, so a
//! single malformed entry never discards the rest of the batch.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::fact::{Confidence, Domain, Fact, Source};
use crate::queue::QueueRow;
use crate::store::{FactStore, QueueTable};

const WORKER_BATCH_SIZE: usize = 5;
/// Skip extraction for messages shorter than this many characters.
const MIN_MESSAGE_LEN: usize = 8;

/// External collaborator: calls the local classifier/extraction model with a
/// fixed prompt and returns its raw text response.
#[async_trait::async_trait]
pub trait ExtractFn: Send + Sync {
    async fn extract(&self, message: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct RawExtractedFact {
    #[serde(default)]
    fact: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
}

/// Parse a domain slug, case-insensitively. Unknown slugs are rejected
/// (the whole item is dropped) rather than defaulted, since a silently wrong
/// domain corrupts the one-active-fact-per-domain invariant.
fn parse_domain(s: &str) -> Option<Domain> {
    Some(match s.to_lowercase().as_str() {
        "health" => Domain::Health,
        "preferences" => Domain::Preferences,
        "work" => Domain::Work,
        "relationships" => Domain::Relationships,
        "schedule" => Domain::Schedule,
        "goals" => Domain::Goals,
        "general" => Domain::General,
        "decisions" => Domain::Decisions,
        "personal" => Domain::Personal,
        "projects" => Domain::Projects,
        _ => return None,
    })
}

fn parse_confidence(s: &str) -> Option<Confidence> {
    Some(match s.to_lowercase().as_str() {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        "low" => Confidence::Low,
        _ => return None,
    })
}

/// Strip a ```json fenced block if present, otherwise return the input
/// unchanged.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let after_lang = after_fence.strip_prefix("json").unwrap_or(after_fence);
        if let Some(end) = after_lang.rfind("```") {
            return after_lang[..end].trim();
        }
    }
    trimmed
}

/// Parse a JSON array of `{fact, domain, confidence}`, validating each
/// element independently. Invalid elements are dropped; valid ones survive —
/// partial success is first-class.
pub fn parse_extracted_facts(raw: &str, now: chrono::DateTime<Utc>) -> Vec<Fact> {
    let cleaned = strip_fence(raw);
    let Ok(items) = serde_json::from_str::<Vec<RawExtractedFact>>(cleaned) else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            let fact_text = item.fact?;
            if fact_text.trim().is_empty() {
                return None;
            }
            let domain = item.domain.as_deref().and_then(parse_domain)?;
            let confidence = item
                .confidence
                .as_deref()
                .and_then(parse_confidence)
                .unwrap_or(Confidence::Medium);
            Some(Fact::new(domain, fact_text, confidence, "default", Source::Inferred, now))
        })
        .collect()
}

/// Heuristic pre-enqueue filter: skip very short messages, pure questions
/// without personal indicators, and known greetings/acknowledgements.
pub fn should_enqueue(message: &str) -> bool {
    let trimmed = message.trim();
    if trimmed.chars().count() < MIN_MESSAGE_LEN {
        return false;
    }
    let lower = trimmed.to_lowercase();
    const GREETINGS: &[&str] = &["hola", "hi", "hello", "hey", "gracias", "thanks", "ok", "okay", "vale"];
    if GREETINGS.iter().any(|g| lower == *g) {
        return false;
    }
    const PERSONAL_INDICATORS: &[&str] = &["yo ", "mi ", "me ", "i ", "my ", "soy ", "tengo ", "quiero "];
    let is_question = trimmed.ends_with('?') || trimmed.starts_with('?');
    if is_question && !PERSONAL_INDICATORS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    true
}

pub struct ExtractionWorker {
    store: Arc<Mutex<FactStore>>,
    extract_fn: Arc<dyn ExtractFn>,
    processing: Mutex<bool>,
}

impl ExtractionWorker {
    pub fn new(store: Arc<Mutex<FactStore>>, extract_fn: Arc<dyn ExtractFn>) -> Self {
        Self { store, extract_fn, processing: Mutex::new(false) }
    }

    /// Enqueue a user message for extraction, if it passes [`should_enqueue`].
    pub async fn enqueue_message(&self, message_id: uuid::Uuid, text: &str) -> Result<()> {
        if !should_enqueue(text) {
            return Ok(());
        }
        let row = QueueRow::new_with_payload(message_id, text);
        let store = self.store.lock().await;
        store.enqueue(QueueTable::Extraction, &row)?;
        store.enforce_queue_cap(QueueTable::Extraction, 200)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize> {
        {
            let mut busy = self.processing.lock().await;
            if *busy {
                return Ok(0);
            }
            *busy = true;
        }
        let result = self.tick_inner().await;
        *self.processing.lock().await = false;
        result
    }

    async fn tick_inner(&self) -> Result<usize> {
        let now = Utc::now();
        let rows = {
            let store = self.store.lock().await;
            store.pending_rows(QueueTable::Extraction, WORKER_BATCH_SIZE, now)?
        };

        let mut processed = 0;
        for mut row in rows {
            row.mark_processing(now);
            {
                let store = self.store.lock().await;
                store.update_row(QueueTable::Extraction, &row)?;
            }

            let Some(message) = row.payload.clone() else {
                row.mark_completed();
                let store = self.store.lock().await;
                store.update_row(QueueTable::Extraction, &row)?;
                continue;
            };

            match self.extract_fn.extract(&message).await {
                Ok(raw) => {
                    let facts = parse_extracted_facts(&raw, now);
                    let mut store = self.store.lock().await;
                    for fact in facts {
                        store.insert(fact, |_| false)?;
                    }
                    row.mark_completed();
                    processed += 1;
                }
                Err(err) => {
                    warn!(?err, "fact extraction failed");
                    row.mark_failed(err.to_string());
                }
            }
            let store = self.store.lock().await;
            store.update_row(QueueTable::Extraction, &row)?;
        }
        Ok(processed)
    }
}
