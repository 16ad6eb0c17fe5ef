use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    /// Transport chat id of the single user this agent serves.
    pub chat_id: String,
    /// Personality preamble injected as the system prompt of every LLM call.
    pub personality: String,
    pub data_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Vigil".to_string(),
            user_name: String::new(),
            chat_id: "user".to_string(),
            personality: "You are a proactive personal assistant. Be concise and concrete."
                .to_string(),
            data_dir: ".vigil".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Command line of the LLM CLI subprocess (first element is the binary).
    pub command: Vec<String>,
    pub cheap_model: String,
    pub expensive_model: String,
    /// Default per-call timeout for one-shot chat, in seconds.
    pub chat_timeout_secs: u64,
    /// Hard ceiling for tool-augmented runs, in seconds.
    pub tool_timeout_secs: u64,
    pub max_tool_rounds: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "--output-format".to_string(), "json".to_string()],
            cheap_model: "claude-3-5-haiku".to_string(),
            expensive_model: "claude-sonnet-4".to_string(),
            chat_timeout_secs: 120,
            tool_timeout_secs: 1800,
            max_tool_rounds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// IANA timezone used for "now", quiet hours, and calendar-day buckets.
    pub timezone: String,
    pub interval_minutes: u64,
    pub quiet_interval_minutes: u64,
    pub quiet_start_hour: u8,
    pub quiet_end_hour: u8,
    /// Cooldown windows per urgency, in minutes. High/critical never cool down.
    pub cooldown_low_minutes: i64,
    pub cooldown_medium_minutes: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            interval_minutes: 10,
            quiet_interval_minutes: 60,
            quiet_start_hour: 23,
            quiet_end_hour: 7,
            cooldown_low_minutes: 180,
            cooldown_medium_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Daily LLM spend ceiling in USD. 0 disables the gate.
    pub daily_usd: f64,
    /// Fraction of the budget at which a cost_spike signal is raised.
    pub warn_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: 5.0,
            warn_fraction: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Process memory ceiling in MB against which RSS% is computed.
    pub limit_mb: u64,
    /// Sliding window for chronic-pressure detection, in minutes.
    pub chronic_window_minutes: i64,
    /// Fraction of window snapshots above WARN that counts as chronic.
    pub chronic_threshold: f64,
    pub shed_cooldown_minutes: i64,
    pub alert_cooldown_minutes: i64,
    /// KV keys the cache shedder must never touch.
    pub protected_keys: Vec<String>,
    /// Entry cap for the weighted memory-tiers key before low-weight pruning.
    pub max_tracked_tiers: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_mb: 1024,
            chronic_window_minutes: 15,
            chronic_threshold: 0.8,
            shed_cooldown_minutes: 10,
            alert_cooldown_minutes: 30,
            protected_keys: vec![
                "agent-state".to_string(),
                "pending-followups".to_string(),
                "trust-counters".to_string(),
            ],
            max_tracked_tiers: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_per_user: usize,
    /// Per-sender debounce for inbound message fragments, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_per_user: 5,
            debounce_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub max_chars: usize,
    pub max_block_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_chars: 24_000,
            max_block_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Shared secret checked against the `x-vigil-secret` header. Empty
    /// disables the operator surface entirely.
    pub secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7878,
            secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Out-of-band alert endpoint (ntfy-style POST target). Empty disables.
    pub url: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { url: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: ".vigil/logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Directory scanned for module manifests at startup.
    pub manifest_dir: String,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            manifest_dir: ".vigil/modules".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub schedule: ScheduleConfig,
    pub budget: BudgetConfig,
    pub memory: MemoryConfig,
    pub queue: QueueConfig,
    pub prompt: PromptConfig,
    pub server: ServerConfig,
    pub notifier: NotifierConfig,
    pub telemetry: TelemetryConfig,
    pub modules: ModulesConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("VIGIL_TIMEZONE") {
            if !value.is_empty() {
                config.schedule.timezone = value;
            }
        }
        if let Ok(value) = env::var("VIGIL_SERVER_SECRET") {
            if !value.is_empty() {
                config.server.secret = value;
            }
        }
        if let Ok(value) = env::var("VIGIL_NOTIFY_URL") {
            if !value.is_empty() {
                config.notifier.url = value;
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
}
