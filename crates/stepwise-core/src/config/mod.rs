//! Configuration loading and validation.
//!
//! Configuration is JSON5 so comments and trailing commas are accepted.
//! Config location: `~/.stepwise/stepwise.json`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced agent is not configured.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Agent configurations by ID.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    /// Checkpoint storage configuration.
    #[serde(default)]
    pub checkpoints: CheckpointsConfig,

    /// Global settings.
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), agents = config.agents.len(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    ///
    /// # Errors
    ///
    /// Returns error if the content is not valid JSON5 or fails validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("stepwise.json")
    }

    /// Get the Stepwise state directory.
    ///
    /// Uses `STEPWISE_STATE_DIR` env var if set, otherwise `~/.stepwise`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("STEPWISE_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".stepwise")
        } else {
            PathBuf::from(".stepwise")
        }
    }

    /// Directory holding the checkpoint database.
    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.checkpoints
            .path
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("checkpoints"))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (id, agent) in &self.agents {
            agent
                .validate()
                .map_err(|reason| ConfigError::Validation(format!("Agent '{id}': {reason}")))?;
        }
        Ok(())
    }

    /// Get agent config by ID.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownAgent` if no agent has that ID.
    pub fn agent(&self, id: &str) -> Result<&AgentConfig, ConfigError> {
        self.agents
            .get(id)
            .ok_or_else(|| ConfigError::UnknownAgent(id.to_string()))
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Model to use.
    #[serde(default = "default_model")]
    pub model: String,

    /// Provider to use.
    #[serde(default = "default_provider")]
    pub provider: String,

    /// System prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Maximum tokens in response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for sampling.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Enabled tools. Empty means every registered tool.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Filesystem and shell restrictions for privileged tools.
    #[serde(default)]
    pub restriction: RestrictionConfig,

    /// Stop conditions, evaluated in order after every step.
    #[serde(default = "default_stop_conditions")]
    pub stop_conditions: Vec<StopCondition>,

    /// Retry policy for model calls.
    #[serde(default)]
    pub retry: RetryOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider: default_provider(),
            system_prompt: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            tools: vec![],
            restriction: RestrictionConfig::default(),
            stop_conditions: default_stop_conditions(),
            retry: RetryOptions::default(),
        }
    }
}

impl AgentConfig {
    fn validate(&self) -> Result<(), String> {
        if self.model.is_empty() {
            return Err("empty model".to_string());
        }
        self.restriction.validate()?;
        self.retry.validate()?;
        for condition in &self.stop_conditions {
            condition.validate()?;
        }
        Ok(())
    }
}

fn default_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_provider() -> String {
    "anthropic".to_string()
}

const fn default_max_tokens() -> u32 {
    4096
}

const fn default_temperature() -> f32 {
    0.7
}

fn default_stop_conditions() -> Vec<StopCondition> {
    vec![StopCondition::MaxSteps { steps: 25 }]
}

/// What happens when a privileged tool call falls outside the restriction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPolicy {
    /// Suspend the run and ask a human to approve or deny.
    #[default]
    Ask,
    /// Deny outright.
    Deny,
}

/// Restriction applied to filesystem and shell tools.
///
/// Immutable for the lifetime of a run and shared read-only across every
/// tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictionConfig {
    /// Directory that file operations must stay under.
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,

    /// Glob patterns (`*` only) a shell command must fully match.
    #[serde(default)]
    pub command_allowlist: Vec<String>,

    /// Policy for calls outside the restriction.
    #[serde(default)]
    pub approval: ApprovalPolicy,
}

impl Default for RestrictionConfig {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            command_allowlist: vec![],
            approval: ApprovalPolicy::default(),
        }
    }
}

impl RestrictionConfig {
    /// Create a restriction rooted at `base_directory` with an empty allowlist.
    #[must_use]
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            ..Self::default()
        }
    }

    /// Set the command allowlist.
    #[must_use]
    pub fn with_allowlist<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_allowlist = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the approval policy.
    #[must_use]
    pub const fn with_approval(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.base_directory.as_os_str().is_empty() {
            return Err("restriction base directory is empty".to_string());
        }
        if self.command_allowlist.iter().any(|p| p.trim().is_empty()) {
            return Err("command allowlist contains an empty pattern".to_string());
        }
        Ok(())
    }
}

fn default_base_directory() -> PathBuf {
    PathBuf::from(".")
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomize each delay within ±25%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Options that never retry.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Base delay as a duration.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a duration.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 0.0 {
            return Err(format!(
                "backoff multiplier must be positive, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max delay is smaller than base delay".to_string());
        }
        Ok(())
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_true() -> bool {
    true
}

/// Predicate over the accumulated step history that ends an agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StopCondition {
    /// Stop once this many steps have completed.
    MaxSteps {
        /// Step count limit.
        steps: usize,
    },
    /// Stop once cumulative token usage reaches this total.
    MaxTokens {
        /// Token limit (input + output).
        tokens: u64,
    },
    /// Stop after a step executed the named tool.
    ToolExecuted {
        /// Tool name.
        name: String,
    },
    /// Stop when the step's text matches a glob pattern.
    TextMatches {
        /// Pattern (`*` wildcard, anchored).
        pattern: String,
    },
}

impl StopCondition {
    /// Short identifier used in logs and stop reasons.
    #[must_use]
    pub const fn id(&self) -> &'static str {
        match self {
            Self::MaxSteps { .. } => "max_steps",
            Self::MaxTokens { .. } => "max_tokens",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::TextMatches { .. } => "text_matches",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::MaxSteps { steps: 0 } => Err("maxSteps must be at least 1".to_string()),
            Self::ToolExecuted { name } if name.is_empty() => {
                Err("toolExecuted needs a tool name".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Checkpoint storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointsConfig {
    /// Database directory. Defaults to `<state dir>/checkpoints`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_default_agent_config() {
        let agent = AgentConfig::default();
        assert_eq!(agent.retry, RetryOptions::default());
        assert_eq!(agent.restriction.approval, ApprovalPolicy::Ask);
        assert_eq!(agent.stop_conditions, vec![StopCondition::MaxSteps { steps: 25 }]);
    }

    #[test]
    fn test_config_roundtrip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");

        let mut config = Config::default();
        config.agents.insert(
            "reviewer".to_string(),
            AgentConfig {
                model: "gpt-4".to_string(),
                restriction: RestrictionConfig::new("/workspace").with_allowlist(["npm *"]),
                ..Default::default()
            },
        );

        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        let agent = loaded.agent("reviewer").unwrap();
        assert_eq!(agent.model, "gpt-4");
        assert_eq!(agent.restriction.command_allowlist, vec!["npm *".to_string()]);
    }

    #[test]
    fn test_json5_parsing() {
        let json5_content = r#"{
            // Agents keyed by id
            agents: {
                coder: {
                    restriction: {
                        baseDirectory: "/workspace",
                        commandAllowlist: ["npm *", "node *"],
                        approval: "deny",
                    },
                    stopConditions: [
                        { type: "maxSteps", steps: 5 },
                        { type: "textMatches", pattern: "*DONE*" },
                    ],
                    retry: { maxRetries: 1, jitter: false },
                },
            },
            settings: { logFormat: "json" },
        }"#;

        let config = Config::parse(json5_content).unwrap();
        let coder = config.agent("coder").unwrap();
        assert_eq!(coder.restriction.approval, ApprovalPolicy::Deny);
        assert_eq!(coder.stop_conditions.len(), 2);
        assert_eq!(coder.retry.max_retries, 1);
        assert_eq!(coder.retry.base_delay_ms, 1000);
        assert!(!coder.retry.jitter);
        assert_eq!(config.settings.log_format, LogFormat::Json);
    }

    #[test]
    fn test_rejects_empty_allowlist_pattern() {
        let result = Config::parse(r#"{ agents: { a: { restriction: { commandAllowlist: ["  "] } } } }"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_zero_max_steps() {
        let result = Config::parse(r#"{ agents: { a: { stopConditions: [{ type: "maxSteps", steps: 0 }] } } }"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_bad_retry_bounds() {
        let result = Config::parse(r"{ agents: { a: { retry: { baseDelayMs: 5000, maxDelayMs: 10 } } } }");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unknown_agent() {
        let config = Config::default();
        assert!(matches!(config.agent("missing"), Err(ConfigError::UnknownAgent(_))));
    }

    #[test]
    fn test_state_dir() {
        let dir = Config::state_dir();
        assert!(dir.to_str().unwrap().contains("stepwise"));
    }
}
