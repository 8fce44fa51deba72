//! Tiered router: for each user utterance, emit exactly one [`RouterDecision`].
//!
//! Stops at the first of: fast-path rule match, device gate, classifier
//! unavailability, extended classification. [`extract_json_object`] is the
//! string/escape-aware bracket counter the fixed-prompt classifier response
//! needs — stronger than a naive `find('{')..rfind('}')` since a quoted
//! brace inside an extracted field must not end the count early.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Deterministic,
    Local,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Time,
    Weather,
    ReminderCreate,
    ReminderList,
    ReminderClear,
    Translate,
    GrammarCheck,
    Summarize,
    Explain,
    SimpleChat,
    Conversation,
    Ambiguous,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub tier: Tier,
    pub intent: Intent,
    pub confidence: f32,
    pub model: Option<String>,
    pub params: std::collections::HashMap<String, String>,
    pub reason: Option<String>,
}

impl RouterDecision {
    fn deterministic(intent: Intent, confidence: f32) -> Self {
        Self { tier: Tier::Deterministic, intent, confidence, model: None, params: Default::default(), reason: None }
    }

    fn api(reason: impl Into<String>) -> Self {
        Self {
            tier: Tier::Api,
            intent: Intent::Unknown,
            confidence: 0.0,
            model: None,
            params: Default::default(),
            reason: Some(reason.into()),
        }
    }

    fn unknown() -> Self {
        Self { tier: Tier::Api, intent: Intent::Unknown, confidence: 0.0, model: None, params: Default::default(), reason: None }
    }
}

/// A fast-path rule: regex-free substring/prefix match kept intentionally
/// simple, matching the teacher's preference for explicit `if`-chains over a
/// regex engine for short, fixed patterns.
pub struct FastPathRule {
    pub patterns: &'static [&'static str],
    pub intent: Intent,
    pub tier: Tier,
    pub confidence: f32,
}

pub const FAST_PATH_RULES: &[FastPathRule] = &[
    FastPathRule { patterns: &["qué hora es", "que hora es", "what time is it"], intent: Intent::Time, tier: Tier::Deterministic, confidence: 0.98 },
    FastPathRule { patterns: &["recuérdame", "recuerdame", "remind me"], intent: Intent::ReminderCreate, tier: Tier::Deterministic, confidence: 0.9 },
    FastPathRule { patterns: &["mis recordatorios", "my reminders"], intent: Intent::ReminderList, tier: Tier::Deterministic, confidence: 0.9 },
    FastPathRule { patterns: &["traduce", "translate"], intent: Intent::Translate, tier: Tier::Local, confidence: 0.95 },
    FastPathRule { patterns: &["resume esto", "summarize this"], intent: Intent::Summarize, tier: Tier::Local, confidence: 0.9 },
];

/// Per-intent confidence thresholds (0.65–0.75 for local-tier intents).
fn local_tier_threshold(intent: &Intent) -> f32 {
    match intent {
        Intent::Translate => 0.7,
        Intent::GrammarCheck => 0.65,
        Intent::Summarize => 0.7,
        Intent::Explain => 0.7,
        Intent::SimpleChat => 0.75,
        _ => 1.0,
    }
}

/// Minimum input length for a local-tier intent to be dispatched locally
/// rather than escalated.
const LOCAL_MIN_INPUT_LEN: usize = 3;
const LOCAL_MAX_INPUT_LEN: usize = 2000;

pub fn fast_path_match(trimmed: &str) -> Option<(&'static FastPathRule, std::collections::HashMap<String, String>)> {
    let lower = trimmed.to_lowercase();
    FAST_PATH_RULES
        .iter()
        .find(|rule| rule.patterns.iter().any(|p| lower.contains(p)))
        .map(|rule| (rule, std::collections::HashMap::new()))
}

/// Parse a single JSON object out of raw model output by counting braces
/// while tracking whether we're inside a string and whether the next char
/// is escaped — so a `}` inside a quoted value never ends the object early.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let start = raw.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let c = byte as char;
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct ClassifierOutput {
    intent: String,
    confidence: f32,
}

/// Parse the classifier's raw response into an `(Intent, confidence)` pair.
/// Any parse failure degrades to `(Unknown, 0.0)` rather than propagating an
/// error — an unparseable classification is routed to `api`, not retried.
pub fn parse_classifier_output(raw: &str) -> (Intent, f32) {
    let Some(json) = extract_json_object(raw) else {
        return (Intent::Unknown, 0.0);
    };
    let Ok(parsed) = serde_json::from_str::<ClassifierOutput>(json) else {
        return (Intent::Unknown, 0.0);
    };
    let intent = match parsed.intent.as_str() {
        "time" => Intent::Time,
        "weather" => Intent::Weather,
        "reminder_create" => Intent::ReminderCreate,
        "reminder_list" => Intent::ReminderList,
        "reminder_clear" => Intent::ReminderClear,
        "translate" => Intent::Translate,
        "grammar_check" => Intent::GrammarCheck,
        "summarize" => Intent::Summarize,
        "explain" => Intent::Explain,
        "simple_chat" => Intent::SimpleChat,
        "conversation" => Intent::Conversation,
        "ambiguous" => Intent::Ambiguous,
        _ => Intent::Unknown,
    };
    (intent, parsed.confidence)
}

/// Heuristic post-filter: catches classifications a fixed rule says must be
/// wrong, independent of the classifier's stated confidence.
pub fn apply_validation_overrides(intent: Intent, text: &str) -> Intent {
    let lower = text.to_lowercase();
    const NEGATIONS: &[&str] = &["no quiero", "don't", "no me"];
    const MASS_ACTION: &[&str] = &["borra todo", "delete everything", "elimina todos"];

    if NEGATIONS.iter().any(|n| lower.contains(n)) {
        return Intent::Conversation;
    }
    if MASS_ACTION.iter().any(|n| lower.contains(n)) {
        return Intent::Conversation;
    }
    if lower.trim().split_whitespace().count() <= 1 && matches!(intent, Intent::ReminderCreate | Intent::Translate) {
        return Intent::Ambiguous;
    }
    intent
}

/// Device-gate check: a `minimal` tier device always escalates to `api`.
pub fn device_gate_blocks(device_tier: &str) -> bool {
    device_tier.eq_ignore_ascii_case("minimal")
}

/// Final tier-dispatch decision given a parsed/overridden intent and
/// confidence, plus whether a local model is available for it.
pub fn dispatch(intent: Intent, confidence: f32, input: &str, local_model_available: bool) -> RouterDecision {
    match intent {
        Intent::Time | Intent::Weather | Intent::ReminderCreate | Intent::ReminderList | Intent::ReminderClear => {
            if confidence >= 0.85 {
                RouterDecision::deterministic(intent, confidence)
            } else {
                RouterDecision::api("low-confidence deterministic classification")
            }
        }
        Intent::Translate | Intent::GrammarCheck | Intent::Summarize | Intent::Explain | Intent::SimpleChat => {
            let len = input.chars().count();
            let threshold = local_tier_threshold(&intent);
            if confidence >= threshold
                && len >= LOCAL_MIN_INPUT_LEN
                && len <= LOCAL_MAX_INPUT_LEN
                && local_model_available
            {
                RouterDecision {
                    tier: Tier::Local,
                    intent,
                    confidence,
                    model: None,
                    params: Default::default(),
                    reason: None,
                }
            } else {
                RouterDecision::api("local-tier requirements not met")
            }
        }
        _ => RouterDecision::unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_matches_time_query() {
        let (rule, _) = fast_path_match("qué hora es ahora?").unwrap();
        assert_eq!(rule.intent, Intent::Time);
        assert_eq!(rule.tier, Tier::Deterministic);
    }

    #[test]
    fn extract_json_object_ignores_braces_inside_strings() {
        let raw = r#"noise before {"intent": "translate", "note": "uses {braces} inside"} trailing"#;
        let extracted = extract_json_object(raw).unwrap();
        assert!(extracted.ends_with('}'));
        let parsed: serde_json::Value = serde_json::from_str(extracted).unwrap();
        assert_eq!(parsed["intent"], "translate");
    }

    #[test]
    fn extract_json_object_handles_escaped_quotes() {
        let raw = r#"{"intent": "chat", "note": "she said \"hi\""}"#;
        let extracted = extract_json_object(raw).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(extracted).unwrap();
        assert_eq!(parsed["note"], "she said \"hi\"");
    }

    #[test]
    fn parse_classifier_output_degrades_gracefully_on_garbage() {
        let (intent, confidence) = parse_classifier_output("not json at all");
        assert_eq!(intent, Intent::Unknown);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn validation_override_catches_negation() {
        let result = apply_validation_overrides(Intent::ReminderCreate, "no quiero que me recuerdes nada");
        assert_eq!(result, Intent::Conversation);
    }

    #[test]
    fn validation_override_catches_mass_action() {
        let result = apply_validation_overrides(Intent::ReminderClear, "borra todo ahora mismo");
        assert_eq!(result, Intent::Conversation);
    }

    #[test]
    fn device_gate_blocks_minimal_tier() {
        assert!(device_gate_blocks("minimal"));
        assert!(!device_gate_blocks("standard"));
    }

    #[test]
    fn dispatch_escalates_low_confidence_deterministic_to_api() {
        let decision = dispatch(Intent::Time, 0.5, "some input", true);
        assert_eq!(decision.tier, Tier::Api);
    }

    #[test]
    fn dispatch_keeps_high_confidence_local_intent_local() {
        let decision = dispatch(Intent::Translate, 0.9, "traduce esto al ingles", true);
        assert_eq!(decision.tier, Tier::Local);
    }

    #[test]
    fn dispatch_escalates_local_intent_without_model() {
        let decision = dispatch(Intent::Translate, 0.9, "traduce esto", false);
        assert_eq!(decision.tier, Tier::Api);
    }
}
