//! Process-wide configuration.
//!
//! `AppConfig` is loaded once at startup and threaded explicitly through the
//! runtime rather than reached for as a global — see the orchestrator module
//! in `tenet-runtime` for how it is constructed and handed to each subsystem.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    pub thinking_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Tenet".to_string(),
            user_name: String::new(),
            thinking_level: "balanced".to_string(),
        }
    }
}

/// Local model-server connectivity and the classifier/productivity model
/// preferences used by the router and model manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    pub ollama_local_first: bool,
    /// Base URL for the Ollama API. Overridden at runtime by the
    /// `OLLAMA_URL` environment variable when set.
    pub ollama_base_url: String,
    pub disable_local_llm: bool,
    pub model_pull_skip: bool,
    pub openrouter_api_key: String,
    /// Ordered model preference for local-tier intents (translate, summarize,
    /// etc), consulted before the classifier model itself. First entry wins.
    pub local_intent_models: Vec<String>,
    /// Models this machine has actually pulled, used to filter
    /// `local_intent_models` down to what can really be loaded.
    pub installed_models: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_local_first: true,
            ollama_base_url: "http://localhost:11434".to_string(),
            disable_local_llm: false,
            model_pull_skip: false,
            openrouter_api_key: String::new(),
            local_intent_models: vec!["llama3.1:8b".to_string()],
            installed_models: vec!["llama3.1:8b".to_string()],
        }
    }
}

/// Embedding pipeline configuration — model identity, dimension, and the
/// response-cache similarity threshold that depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub enabled: bool,
    pub model: String,
    pub dimension: usize,
    pub cache_similarity_threshold: f32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "Xenova/all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            cache_similarity_threshold: 0.92,
        }
    }
}

/// Coarse device capability tier, overridable for environments where
/// automatic detection is unreliable (containers, CI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTier {
    Minimal,
    Basic,
    Standard,
    Power,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub tier_override: Option<DeviceTier>,
}

/// Reminder scheduler and proactive loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub reminder_tick_secs: u64,
    pub reminder_window_minutes: i64,
    pub proactive_tick_minutes: u64,
    pub quiet_hours_start_hour: u8,
    pub quiet_hours_end_hour: u8,
    pub max_spontaneous_per_hour: u32,
    pub max_spontaneous_per_day: u32,
    pub consecutive_ticks_with_message_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reminder_tick_secs: 60,
            reminder_window_minutes: 5,
            proactive_tick_minutes: 15,
            quiet_hours_start_hour: 23,
            quiet_hours_end_hour: 8,
            max_spontaneous_per_hour: 2,
            max_spontaneous_per_day: 6,
            consecutive_ticks_with_message_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OnboardingConfig {
    pub completed: bool,
}

/// Filesystem layout for the redb store, logs, and the truncation backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub data_dir: String,
    pub log_dir: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.tenet".to_string(),
            log_dir: "~/.tenet/logs".to_string(),
        }
    }
}

impl DataConfig {
    fn expand(raw: &str) -> PathBuf {
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(raw)
    }

    pub fn data_dir_path(&self) -> PathBuf {
        Self::expand(&self.data_dir)
    }

    pub fn log_dir_path(&self) -> PathBuf {
        Self::expand(&self.log_dir)
    }
}

fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    pub device: DeviceConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
    pub onboarding: OnboardingConfig,
    pub data: DataConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }
        if let Ok(value) = env::var("OLLAMA_MODEL") {
            if !value.is_empty() {
                config.llm.ollama_model = value;
            }
        }
        if let Ok(value) = env::var("EMBEDDINGS_ENABLED") {
            config.embeddings.enabled = value.eq_ignore_ascii_case("true") || value == "1";
        }
        if let Ok(value) = env::var("EMBEDDINGS_MODEL") {
            if !value.is_empty() {
                config.embeddings.model = value;
            }
        }
        if let Ok(value) = env::var("EMBEDDING_DIMENSION") {
            if let Ok(dim) = value.parse() {
                config.embeddings.dimension = dim;
            }
        }
        if let Ok(value) = env::var("CACHE_SIMILARITY_THRESHOLD") {
            if let Ok(threshold) = value.parse() {
                config.embeddings.cache_similarity_threshold = threshold;
            }
        }
        if let Ok(value) = env::var("LLM_MODEL") {
            if !value.is_empty() {
                config.llm.openrouter_model = value;
            }
        }
        if let Ok(value) = env::var("TENET_DATA_DIR") {
            if !value.is_empty() {
                config.data.data_dir = value;
            }
        }
        if let Ok(value) = env::var("TENET_LOG_DIR") {
            if !value.is_empty() {
                config.data.log_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            &self.llm.openrouter_model
        } else {
            &self.llm.ollama_model
        }
    }

    pub fn needs_onboarding(&self) -> bool {
        !self.onboarding.completed
    }
}
