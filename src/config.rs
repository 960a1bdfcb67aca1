//! Configuration Management
//!
//! Loads and manages agent configuration from TOML files.
//! Configuration includes:
//! - API settings (endpoint, model selection)
//! - Engine behavior (tool call caps, run timeout, reflection caps)
//! - Command policy (execution mode, auto-correction)
//! - Persona and localisation
//! - Host catalog for the orchestrator

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Policy determining which risk levels require confirmation before a
/// command touches the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Every mutating command asks for confirmation (default)
    #[default]
    Strict,
    /// Only dangerous commands ask for confirmation
    Relaxed,
    /// Everything except blocked commands auto-executes
    Free,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Strict => write!(f, "strict"),
            ExecutionMode::Relaxed => write!(f, "relaxed"),
            ExecutionMode::Free => write!(f, "free"),
        }
    }
}

/// Localisation catalog selector for user-visible strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum Language {
    #[serde(rename = "en-US")]
    #[value(name = "en-US")]
    #[default]
    EnUs,
    #[serde(rename = "zh-CN")]
    #[value(name = "zh-CN")]
    ZhCn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub api_key: Option<String>,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default)]
    pub language: Language,

    /// User rules appended verbatim to the system prompt.
    #[serde(default)]
    pub rules: String,

    #[serde(default)]
    pub persona: PersonaConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub terminal: TerminalConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Hosts the orchestrator may open terminals on.
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// One of the 16 MBTI codes, or None for the neutral persona.
    #[serde(default)]
    pub mbti: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_max_reflections")]
    pub max_reflections: usize,
    /// Minimum tool calls between two reflection injections.
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval: usize,
    #[serde(default = "default_prompt_token_budget")]
    pub prompt_token_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            run_timeout_secs: default_run_timeout(),
            max_reflections: default_max_reflections(),
            reflection_interval: default_reflection_interval(),
            prompt_token_budget: default_prompt_token_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Seconds of trailing silence before a non-idle terminal classifies
    /// as possibly stuck.
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,
    #[serde(default = "default_true")]
    pub auto_correct_commands: bool,
    /// Lines of scrollback the classifier inspects.
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            stuck_after_secs: default_stuck_after(),
            auto_correct_commands: default_true(),
            context_lines: default_context_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// One connectable host for the orchestrator's catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub kind: HostKind,
    /// Shell to spawn for local hosts, `user@host` for ssh hosts.
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    #[default]
    Local,
    Ssh,
}

fn default_endpoint() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_model() -> String {
    "qwen2.5-coder:latest".to_string()
}
fn default_max_tokens() -> usize {
    8192
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tool_calls() -> usize {
    60
}
fn default_run_timeout() -> u64 {
    1800
}
fn default_max_reflections() -> usize {
    3
}
fn default_reflection_interval() -> usize {
    3
}
fn default_prompt_token_budget() -> usize {
    6000
}
fn default_command_timeout() -> u64 {
    30
}
fn default_stuck_after() -> u64 {
    20
}
fn default_context_lines() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        // Serde defaults and the struct defaults must agree; route through
        // an empty TOML document so there is one source of truth.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the default
    /// location (`~/.config/shellpilot/config.toml`) when `path` is None.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("SHELLPILOT_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shellpilot")
            .join("config.toml")
    }

    /// Clamp out-of-range values to their documented minimums.
    pub fn validate(&mut self) -> Result<()> {
        if self.engine.max_tool_calls < 5 {
            warn!(
                max_tool_calls = self.engine.max_tool_calls,
                "max_tool_calls below minimum, clamping to 5"
            );
            self.engine.max_tool_calls = 5;
        }
        if self.engine.run_timeout_secs < 30 {
            warn!(
                run_timeout_secs = self.engine.run_timeout_secs,
                "run_timeout_secs below minimum, clamping to 30"
            );
            self.engine.run_timeout_secs = 30;
        }
        if self.engine.max_reflections < 1 {
            self.engine.max_reflections = 1;
        }
        if self.terminal.command_timeout_secs < 1 {
            self.terminal.command_timeout_secs = 1;
        }
        if let Some(ref code) = self.persona.mbti {
            if !crate::prompt::is_valid_mbti(code) {
                anyhow::bail!("Unknown MBTI code in persona.mbti: {}", code);
            }
        }
        Ok(())
    }

    /// Resolve a host entry by id or alias.
    pub fn find_host(&self, key: &str) -> Option<&HostEntry> {
        self.hosts
            .iter()
            .find(|h| h.id == key || h.alias.as_deref() == Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.execution_mode, ExecutionMode::Strict);
        assert_eq!(config.engine.max_tool_calls, 60);
        assert_eq!(config.engine.run_timeout_secs, 1800);
        assert_eq!(config.engine.max_reflections, 3);
        assert_eq!(config.terminal.command_timeout_secs, 30);
        assert_eq!(config.terminal.stuck_after_secs, 20);
        assert!(config.terminal.auto_correct_commands);
        assert_eq!(config.language, Language::EnUs);
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            endpoint = "https://api.example.com/v1"
            model = "gpt-4o"
            execution_mode = "relaxed"
            language = "zh-CN"
            rules = "Never reboot the database hosts."

            [persona]
            mbti = "INTJ"

            [engine]
            max_tool_calls = 40

            [terminal]
            command_timeout_secs = 10

            [[hosts]]
            id = "web-1"
            alias = "frontend"
            kind = "ssh"
            connection = "ops@web-1.internal"
        "#;
        let mut config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Relaxed);
        assert_eq!(config.language, Language::ZhCn);
        assert_eq!(config.engine.max_tool_calls, 40);
        assert_eq!(config.persona.mbti.as_deref(), Some("INTJ"));
        assert_eq!(config.find_host("frontend").unwrap().id, "web-1");
        assert!(config.find_host("db-9").is_none());
    }

    #[test]
    fn test_validate_clamps_minimums() {
        let mut config = Config::default();
        config.engine.max_tool_calls = 1;
        config.engine.run_timeout_secs = 5;
        config.terminal.command_timeout_secs = 0;
        config.validate().unwrap();
        assert_eq!(config.engine.max_tool_calls, 5);
        assert_eq!(config.engine.run_timeout_secs, 30);
        assert_eq!(config.terminal.command_timeout_secs, 1);
    }

    #[test]
    fn test_validate_rejects_bad_mbti() {
        let mut config = Config::default();
        config.persona.mbti = Some("ABCD".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let raw = "unknown_key = 1";
        assert!(toml::from_str::<Config>(raw).is_err());
    }
}
