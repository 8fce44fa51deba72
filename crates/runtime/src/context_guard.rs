//! Context guard: keep the conversation within a token budget, newest first,
//! and never silently lose a fact-bearing message without a backup attempt.

use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single chat-history entry as the guard sees it. Deliberately decoupled
/// from the runtime's own turn representation (still being generalized onto
/// the new memory API) — conversion at the call site is a one-line `map`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardMessage {
    pub role: String,
    pub content: String,
    pub tool_calls_json: Option<String>,
}

pub struct TokenBudget {
    pub max_tokens: usize,
    pub system_prompt_reserve: usize,
    pub response_reserve: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self { max_tokens: 100_000, system_prompt_reserve: 4_000, response_reserve: 4_000 }
    }
}

impl TokenBudget {
    pub fn available(&self) -> usize {
        self.max_tokens.saturating_sub(self.system_prompt_reserve).saturating_sub(self.response_reserve)
    }
}

/// Rough token estimate: `len(content) / 4` plus a fixed overhead for a
/// serialized tool-call payload, when present.
pub fn estimate_tokens(turn: &GuardMessage) -> usize {
    let base = turn.content.chars().count() / 4;
    let tool_overhead = if turn.tool_calls_json.is_some() { 40 } else { 0 };
    base + tool_overhead
}

#[derive(Debug, Clone)]
pub struct GuardResult {
    pub truncated: bool,
    pub original_count: usize,
    pub final_count: usize,
    pub estimated_tokens: usize,
    pub potential_facts_warning: Option<String>,
    pub backup_failed: bool,
    pub topic_shift_detected: bool,
}

/// Heuristic fact-pattern library: phrases strongly correlated with a
/// personal fact worth remembering, used only to decide whether a truncated
/// message deserves a backup attempt — not a replacement for the extraction
/// worker's own classification.
const FACT_PATTERNS: &[&str] = &[
    "me llamo", "mi nombre es", "trabajo en", "vivo en", "tengo una cita",
    "my name is", "i work at", "i live in", "i have an appointment",
];

fn looks_like_fact(content: &str) -> bool {
    let lower = content.to_lowercase();
    FACT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Synchronous, append-only backup of removed turns to a recovery file.
/// Creates the parent directory first. Returns `Ok(())` on success.
fn backup_removed(path: &Path, removed: &[GuardMessage]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    for turn in removed {
        let line = serde_json::to_string(turn).unwrap_or_default();
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Heuristic topic-shift detector: a short keyword-overlap check between the
/// new message and the last few turns. Returns true on low overlap.
fn detect_topic_shift_heuristic(new_message: &str, recent: &[GuardMessage]) -> bool {
    if recent.is_empty() {
        return false;
    }
    let new_words: std::collections::HashSet<String> =
        new_message.to_lowercase().split_whitespace().map(String::from).collect();
    if new_words.is_empty() {
        return false;
    }
    let recent_words: std::collections::HashSet<String> = recent
        .iter()
        .rev()
        .take(3)
        .flat_map(|t| t.content.to_lowercase().split_whitespace().map(String::from).collect::<Vec<_>>())
        .collect();
    let overlap = new_words.intersection(&recent_words).count();
    overlap == 0
}

/// Truncate `turns` to fit `budget`, newest-to-oldest, with fact-pattern
/// backup of anything removed and a topic-shift check against the incoming
/// user message. `embedding_continuity` is `Some(similarity)` when the
/// embedding model is ready; a value `<= 0.3` is an additional topic-shift
/// signal, combined with the heuristic via logical OR.
pub fn apply(
    turns: Vec<GuardMessage>,
    budget: &TokenBudget,
    new_user_message: &str,
    embedding_continuity: Option<f32>,
    backup_path: &Path,
) -> (Vec<GuardMessage>, GuardResult) {
    let original_count = turns.len();
    let available = budget.available();

    let total_tokens: usize = turns.iter().map(estimate_tokens).sum();
    if total_tokens <= available {
        let topic_shift = detect_topic_shift_heuristic(new_user_message, &turns)
            || embedding_continuity.map(|c| c <= 0.3).unwrap_or(false);
        return (
            turns,
            GuardResult {
                truncated: false,
                original_count,
                final_count: original_count,
                estimated_tokens: total_tokens,
                potential_facts_warning: None,
                backup_failed: false,
                topic_shift_detected: topic_shift,
            },
        );
    }

    let mut kept: Vec<GuardMessage> = Vec::new();
    let mut cumulative = 0usize;
    for turn in turns.iter().rev() {
        let cost = estimate_tokens(turn);
        if cumulative + cost > available && !kept.is_empty() {
            break;
        }
        cumulative += cost;
        kept.push(turn.clone());
    }
    if kept.is_empty() {
        if let Some(last) = turns.last() {
            kept.push(last.clone());
            cumulative = estimate_tokens(last);
        }
    }
    kept.reverse();

    let removed: Vec<GuardMessage> = turns[..original_count - kept.len()].to_vec();
    let mut potential_facts_warning = None;
    let mut backup_failed = false;

    if removed.iter().any(|t| looks_like_fact(&t.content)) {
        match backup_removed(backup_path, &removed) {
            Ok(()) => {
                potential_facts_warning =
                    Some(format!("{} removed message(s) may contain facts; backed up", removed.len()));
            }
            Err(err) => {
                warn!(?err, "context guard backup failed");
                backup_failed = true;
                potential_facts_warning =
                    Some(format!("{} removed message(s) may contain facts; backup FAILED", removed.len()));
            }
        }
    }

    let topic_shift = detect_topic_shift_heuristic(new_user_message, &kept)
        || embedding_continuity.map(|c| c <= 0.3).unwrap_or(false);

    let final_count = kept.len();
    (
        kept,
        GuardResult {
            truncated: true,
            original_count,
            final_count,
            estimated_tokens: cumulative,
            potential_facts_warning,
            backup_failed,
            topic_shift_detected: topic_shift,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(content: &str) -> GuardMessage {
        GuardMessage { role: "user".to_string(), content: content.to_string(), tool_calls_json: None }
    }

    #[test]
    fn no_truncation_when_under_budget() {
        let turns = vec![turn("hola"), turn("como estas")];
        let budget = TokenBudget { max_tokens: 100_000, system_prompt_reserve: 4_000, response_reserve: 4_000 };
        let (kept, result) = apply(turns.clone(), &budget, "sigamos", None, Path::new("/tmp/unused_backup.jsonl"));
        assert!(!result.truncated);
        assert_eq!(kept.len(), turns.len());
    }

    #[test]
    fn truncation_keeps_newest_first() {
        let turns: Vec<GuardMessage> = (0..50).map(|i| turn(&format!("turn {i} {}", "x".repeat(500)))).collect();
        let budget = TokenBudget { max_tokens: 2_000, system_prompt_reserve: 0, response_reserve: 0 };
        let (kept, result) = apply(turns, &budget, "nuevo mensaje", None, Path::new("/tmp/unused_backup2.jsonl"));
        assert!(result.truncated);
        assert!(kept.last().unwrap().content.contains("turn 49"));
    }

    #[test]
    fn always_keeps_at_least_one_message_even_if_over_budget() {
        let turns = vec![turn(&"x".repeat(100_000))];
        let budget = TokenBudget { max_tokens: 10, system_prompt_reserve: 0, response_reserve: 0 };
        let (kept, result) = apply(turns, &budget, "hola", None, Path::new("/tmp/unused_backup3.jsonl"));
        assert_eq!(kept.len(), 1);
        assert!(result.truncated);
    }

    #[test]
    fn removed_fact_bearing_message_triggers_backup_and_warning() {
        let dir = std::env::temp_dir().join(format!("ctx_guard_test_{}", uuid::Uuid::new_v4()));
        let backup_path = dir.join("backup.jsonl");
        let mut turns = vec![turn("me llamo Ana y vivo en Madrid")];
        for i in 0..50 {
            turns.push(turn(&format!("relleno {i} {}", "x".repeat(200))));
        }
        let budget = TokenBudget { max_tokens: 300, system_prompt_reserve: 0, response_reserve: 0 };
        let (_kept, result) = apply(turns, &budget, "otra cosa", None, &backup_path);
        assert!(result.truncated);
        assert!(result.potential_facts_warning.is_some());
        assert!(!result.backup_failed);
        assert!(backup_path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn topic_shift_detected_via_low_embedding_continuity() {
        let turns = vec![turn("hablemos de cocina")];
        let budget = TokenBudget::default();
        let (_kept, result) = apply(turns, &budget, "y el clima?", Some(0.1), Path::new("/tmp/unused_backup4.jsonl"));
        assert!(result.topic_shift_detected);
    }
}
