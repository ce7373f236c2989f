use chrono_tz::Tz;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::scheduler::SchedulerConfig;

pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct Config {
    pub anthropic_api_key: String,
    pub anthropic_api_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub max_tool_iterations: usize,
    pub max_history_messages: usize,
    /// Overrides the built-in system prompt template when set
    pub system_prompt: Option<String>,
    pub llm_timeout: Duration,

    pub auto_compaction: bool,
    pub compaction_token_threshold: u32,
    pub compact_to_recent_messages: usize,

    pub database_url: String,

    pub scheduler_workers: usize,
    pub scheduler_timezone: Tz,

    /// Root directory holding one sub-directory per project
    pub projects_dir: PathBuf,

    pub http_port: u16,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("anthropic_api_url", &self.anthropic_api_url)
            .field("model", &self.model)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("max_tool_iterations", &self.max_tool_iterations)
            .field("max_history_messages", &self.max_history_messages)
            .field("llm_timeout", &self.llm_timeout)
            .field("auto_compaction", &self.auto_compaction)
            .field("compaction_token_threshold", &self.compaction_token_threshold)
            .field("scheduler_workers", &self.scheduler_workers)
            .field("scheduler_timezone", &self.scheduler_timezone)
            .field("projects_dir", &self.projects_dir)
            .field("http_port", &self.http_port)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            anthropic_api_key: required(&get, "ANTHROPIC_API_KEY")?,
            anthropic_api_url: get("ANTHROPIC_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            model: get("ANTHROPIC_MODEL").unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            max_output_tokens: parsed(&get, "MAX_OUTPUT_TOKENS", 4096)?,
            max_tool_iterations: parsed(&get, "MAX_TOOL_ITERATIONS", 10)?,
            max_history_messages: parsed(&get, "MAX_HISTORY_MESSAGES", 50)?,
            system_prompt: get("SYSTEM_PROMPT"),
            llm_timeout: Duration::from_secs(parsed(&get, "LLM_TIMEOUT_SECS", 120)?),

            auto_compaction: parsed(&get, "AUTO_COMPACTION", true)?,
            compaction_token_threshold: parsed(&get, "COMPACTION_TOKEN_THRESHOLD", 180_000)?,
            compact_to_recent_messages: parsed(&get, "COMPACT_TO_RECENT_MESSAGES", 30)?,

            database_url: required(&get, "DATABASE_URL")?,

            scheduler_workers: parsed(&get, "SCHEDULER_WORKERS", 4)?,
            scheduler_timezone: parsed(&get, "SCHEDULER_TIMEZONE", Tz::UTC)?,

            projects_dir: get("PROJECTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./projects")),

            http_port: parsed(&get, "HTTP_PORT", 3000)?,
        })
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            max_output_tokens: self.max_output_tokens,
            max_iterations: self.max_tool_iterations,
            max_history: self.max_history_messages,
            system_prompt_template: self.system_prompt.clone(),
            auto_compaction: self.auto_compaction,
            compaction_token_threshold: self.compaction_token_threshold,
            compact_to_recent: self.compact_to_recent_messages,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.scheduler_workers,
            timezone: self.scheduler_timezone,
            ..SchedulerConfig::default()
        }
    }
}

fn required<G>(get: &G, name: &'static str) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(name).ok_or(ConfigError::Missing(name))
}

fn parsed<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}
