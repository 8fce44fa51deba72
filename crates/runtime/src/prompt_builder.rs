//! Centralized prompt assembly for the main LLM conversation call.
//!
//! A pure function over [`PromptInputs`] — all async work (retrieval,
//! embeddings, tool specs) happens before this is called so the assembly
//! itself never blocks on I/O.

use chrono::Utc;
use uuid::Uuid;

use tenet_config::AppConfig;
use tenet_memory::RankedFact;

use crate::context_guard::GuardMessage;
use crate::router::{RouterDecision, Tier};

/// All pre-computed data needed to assemble the final LLM prompt.
pub struct PromptInputs<'a> {
    pub config: &'a AppConfig,
    pub user_message: &'a str,
    pub recent_turns: &'a [GuardMessage],
    pub tool_specs: &'a [tenet_tools::ToolSpec],
    pub pending_follow_ups: &'a [(Uuid, String)],
    /// Facts retrieved by the hybrid search for this turn, highest-scored first.
    pub context_items: &'a [RankedFact],
    /// The router's tier decision for this turn — on `Deterministic`/`Local`
    /// tiers the tool catalogue is omitted entirely since no tool call is
    /// expected from the model.
    pub decision: &'a RouterDecision,
    /// Set when the context guard truncated history this turn, so the model
    /// can be told older context was dropped rather than silently vanish.
    pub truncation_warning: Option<&'a str>,
}

/// Assemble the full system + user prompt for the main LLM call.
pub fn build_chat_prompt(inputs: &PromptInputs<'_>) -> String {
    let config = inputs.config;

    let thought_style = config.agent.thinking_level.to_lowercase();
    let follow_up_block = build_follow_up_block(inputs.pending_follow_ups);
    let context_block = build_context_block(inputs.context_items);
    let environment_block = build_environment_block(config, inputs.recent_turns.len());
    let conversation_block = build_conversation_block(inputs.recent_turns);
    let truncation_block = build_truncation_block(inputs.truncation_warning);
    let tools_section = match inputs.decision.tier {
        Tier::Deterministic | Tier::Local => String::new(),
        Tier::Api => build_tools_and_grounding(inputs.tool_specs),
    };

    format!(
        "You are {name}. Thinking depth: {thought_style}.\n\
         Use ENVIRONMENT CONTEXT for real-world grounding, RECENT CONVERSATION for immediate \n\
         continuity, and MEMORY CONTEXT for durable background facts.\n\
         Never repeat previous answers unless asked.\n\
         Respond directly and specifically to the LATEST user message.\
         {follow_ups}{tools_section}{truncation}\n\n\
         ENVIRONMENT CONTEXT:\n{env}\n\n\
         RECENT CONVERSATION:\n{conv}\n\n\
         MEMORY CONTEXT:\n{mem}\n\n\
         LATEST USER MESSAGE:\n{msg}\n\n\
         ASSISTANT RESPONSE:",
        name = config.agent.name,
        follow_ups = follow_up_block,
        tools_section = tools_section,
        truncation = truncation_block,
        env = environment_block,
        conv = conversation_block,
        mem = context_block,
        msg = inputs.user_message,
    )
}

// ─── block builders ──────────────────────────────────────────────────────────

fn build_follow_up_block(follow_ups: &[(Uuid, String)]) -> String {
    if follow_ups.is_empty() {
        return String::new();
    }
    let items = follow_ups.iter().map(|(_, text)| format!("- {text}")).collect::<Vec<_>>().join("\n");
    format!(
        "\n\nPENDING FOLLOW-UPS (things you wanted to raise with the user):\n\
         {items}\n\
         [If appropriate, acknowledge these naturally at the start of your response.]"
    )
}

fn build_truncation_block(warning: Option<&str>) -> String {
    match warning {
        Some(msg) => format!(
            "\n\nNOTE: some earlier conversation history was dropped to stay within the \
             context budget ({msg}). Don't refer to it as if it were still available."
        ),
        None => String::new(),
    }
}

fn build_context_block(context: &[RankedFact]) -> String {
    let header = format!("[Memory: {} fact(s) retrieved]", context.len());
    if context.is_empty() {
        return format!("{header}\n(no relevant memories retrieved)");
    }
    let items = context
        .iter()
        .map(|item| {
            format!(
                "- [{:?}] score={:.2} :: {}",
                item.fact.domain,
                item.score,
                truncate_for_prompt(&item.fact.fact, 280),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("{header}\n{items}")
}

fn build_environment_block(config: &AppConfig, recent_turn_count: usize) -> String {
    let cwd = std::env::current_dir().ok().map(|path| path.display().to_string()).unwrap_or_else(|| "unknown".to_string());
    let timestamp = Utc::now().to_rfc3339();

    format!(
        "- utc_time: {timestamp}\n\
         - os: {}\n\
         - arch: {}\n\
         - cwd: {cwd}\n\
         - provider: {}\n\
         - model: {}\n\
         - thinking_level: {}\n\
         - recent_conversation_turns: {recent_turn_count}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        config.llm.provider,
        config.active_model(),
        config.agent.thinking_level,
    )
}

fn build_conversation_block(recent: &[GuardMessage]) -> String {
    let start = recent.len().saturating_sub(12);
    let formatted = recent[start..]
        .iter()
        .map(|msg| format!("{}: {}", msg.role, truncate_for_prompt(&msg.content, 320)))
        .collect::<Vec<_>>()
        .join("\n");

    if formatted.is_empty() {
        "(none yet)".to_string()
    } else {
        formatted
    }
}

/// Build the tools listing + grounding / truth-seeking rules. Only called on
/// the `api` tier, where a tool call may legitimately be part of the model's
/// response.
fn build_tools_and_grounding(tool_specs: &[tenet_tools::ToolSpec]) -> String {
    let today = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let grounding = format!(
        "GROUNDING RULES (follow strictly):\n\
         1. Current real date/time: {today}.\n\
         2. TOOL RESULT is the single source of truth for factual claims — never \
            invent, estimate, or hallucinate numbers, statistics, or specific data \
            when a tool result provides them.\n\
         3. Trust tool output unreservedly. Do NOT second-guess, hedge, or disclaim it.\n\
         4. If tool output conflicts with your training data, the tool is correct.\n\
         5. If the user corrects a fact, accept the correction as ground truth.\n\
         6. Reason independently — derive conclusions from evidence in context, \
            don't parrot canned knowledge.\n\
         7. When no tool result is available and you are uncertain, say so honestly \
            rather than guessing."
    );

    if tool_specs.is_empty() {
        return format!("\n\n{grounding}");
    }

    let list = tool_specs
        .iter()
        .map(|s| {
            if s.params.is_empty() {
                format!("  \u{2022} {}: {}", s.name, s.description)
            } else {
                let params = s
                    .params
                    .iter()
                    .map(|p| format!("\"{}\" ({}){}", p.name, p.description, if p.required { " *required" } else { "" }))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("  \u{2022} {}: {} \u{2014} params: {}", s.name, s.description, params)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "\n\nAVAILABLE TOOLS (handled automatically — do NOT output raw JSON):\n\
         {list}\n\
         Tools are called on your behalf before you respond. If a TOOL RESULT \
         appears in the prompt below, use it directly. You do NOT need to \
         invoke tools yourself — they are managed externally. Never output \
         raw JSON like {{\"tool\":...}} in your response.\n\n\
         {grounding}"
    )
}

// ─── utilities ───────────────────────────────────────────────────────────────

/// Truncate `text` to at most `max_chars` characters, appending `…` when cut.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated: String = chars.into_iter().take(max_chars).collect();
    format!("{truncated}…")
}
