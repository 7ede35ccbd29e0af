use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::{Reasoning, ReasoningEffort, RequestOptions};
use crate::{RelayError, Result};

/// Top-level runtime configuration
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    pub orchestrator: OrchestratorConfig,
    pub tools: ToolsConfig,
    pub provider: ProviderSettings,
}

/// Turn loop limits and per-call defaults
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Maximum provider calls per run
    pub max_turns: u32,
    /// Wall-clock budget for a whole run (provider calls plus tools)
    pub run_timeout_ms: u64,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub reasoning: Option<Reasoning>,
}

#[derive(Clone, Debug)]
pub struct ToolsConfig {
    pub timeout_ms: u64,
    pub working_directory: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(alias = "openai_chat")]
    Openai,
    OpenaiResponses,
    Ollama,
    Scripted,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "openai" | "openai_chat" => Some(ProviderKind::Openai),
            "openai_responses" | "responses" => Some(ProviderKind::OpenaiResponses),
            "ollama" => Some(ProviderKind::Ollama),
            "scripted" | "offline" => Some(ProviderKind::Scripted),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Openai | ProviderKind::OpenaiResponses => "https://api.openai.com/v1",
            ProviderKind::Ollama => "http://localhost:11434",
            ProviderKind::Scripted => "",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
            ProviderKind::Openai | ProviderKind::OpenaiResponses => "gpt-4o-mini",
            ProviderKind::Ollama => "llama3.1",
            ProviderKind::Scripted => "scripted",
        }
    }

    /// Provider-specific API key variable
    fn key_var(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Openai | ProviderKind::OpenaiResponses => Some("OPENAI_API_KEY"),
            ProviderKind::Ollama | ProviderKind::Scripted => None,
        }
    }
}

/// Connection settings for the selected backend
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Connect timeout for the initial request
    pub request_timeout_ms: u64,
    /// Maximum silence between two stream frames
    pub idle_timeout_ms: u64,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: env_parse("RELAY_MAX_TURNS").unwrap_or(25),
            run_timeout_ms: env_parse("RELAY_RUN_TIMEOUT_MS").unwrap_or(600_000),
            max_tokens: env_parse("RELAY_MAX_TOKENS").unwrap_or(8_192),
            system_prompt: std::env::var("RELAY_SYSTEM_PROMPT").unwrap_or_else(|_| {
                "You are a helpful assistant working inside the user's project directory. Use the available tools when they help.".into()
            }),
            reasoning: env_string("RELAY_REASONING_EFFORT")
                .and_then(|e| parse_effort(&e))
                .map(Reasoning::Effort),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: env_parse("RELAY_TOOL_TIMEOUT_MS").unwrap_or(30_000),
            working_directory: env_string("RELAY_WORKING_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        let kind = env_string("RELAY_PROVIDER")
            .and_then(|k| ProviderKind::parse(&k))
            .unwrap_or(ProviderKind::Anthropic);
        Self::for_kind(kind)
    }
}

impl ProviderSettings {
    /// Defaults for one backend, honoring env overrides
    pub fn for_kind(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: env_string("RELAY_BASE_URL")
                .unwrap_or_else(|| kind.default_base_url().to_string()),
            model: env_string("RELAY_MODEL").unwrap_or_else(|| kind.default_model().to_string()),
            api_key: env_string("RELAY_API_KEY").or_else(|| kind.key_var().and_then(env_string)),
            request_timeout_ms: env_parse("RELAY_REQUEST_TIMEOUT_MS").unwrap_or(30_000),
            idle_timeout_ms: env_parse("RELAY_IDLE_TIMEOUT_MS").unwrap_or(120_000),
        }
    }
}

impl OrchestratorConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Per-call options derived from the configured defaults
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            system: self.system_prompt.clone(),
            tools: Vec::new(),
            max_tokens: self.max_tokens,
            reasoning: self.reasoning,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn parse_effort(raw: &str) -> Option<ReasoningEffort> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" => Some(ReasoningEffort::Low),
        "medium" => Some(ReasoningEffort::Medium),
        "high" => Some(ReasoningEffort::High),
        _ => None,
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file (path via RELAY_CONFIG or ./relay.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "relay.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::overlay_str(default.clone(), &s) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Overlay a TOML document onto `base`
    pub fn overlay_str(base: RelayConfig, toml_src: &str) -> Result<RelayConfig> {
        let t: RelayToml =
            toml::from_str(toml_src).map_err(|e| RelayError::Config(e.to_string()))?;
        t.overlay(base)
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, Deserialize)]
struct RelayToml {
    pub orchestrator: Option<OrchestratorToml>,
    pub tools: Option<ToolsToml>,
    pub provider: Option<ProviderToml>,
}

impl RelayToml {
    fn overlay(self, mut base: RelayConfig) -> Result<RelayConfig> {
        if let Some(o) = self.orchestrator {
            o.apply(&mut base.orchestrator)?;
        }
        if let Some(t) = self.tools {
            t.apply(&mut base.tools);
        }
        if let Some(p) = self.provider {
            p.apply(&mut base.provider)?;
        }
        Ok(base)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OrchestratorToml {
    pub max_turns: Option<u32>,
    pub run_timeout_ms: Option<u64>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub reasoning_effort: Option<String>,
    pub reasoning_budget_tokens: Option<u32>,
}
impl OrchestratorToml {
    fn apply(self, o: &mut OrchestratorConfig) -> Result<()> {
        if let Some(x) = self.max_turns {
            if x == 0 {
                return Err(RelayError::Config("max_turns must be at least 1".into()));
            }
            o.max_turns = x;
        }
        if let Some(x) = self.run_timeout_ms {
            o.run_timeout_ms = x;
        }
        if let Some(x) = self.max_tokens {
            o.max_tokens = x;
        }
        if let Some(x) = self.system_prompt {
            o.system_prompt = x;
        }
        if let Some(x) = self.reasoning_effort {
            let effort = parse_effort(&x)
                .ok_or_else(|| RelayError::Config(format!("unknown reasoning effort: {x}")))?;
            o.reasoning = Some(Reasoning::Effort(effort));
        }
        if let Some(x) = self.reasoning_budget_tokens {
            o.reasoning = Some(Reasoning::BudgetTokens(x));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ToolsToml {
    pub timeout_ms: Option<u64>,
    pub working_directory: Option<PathBuf>,
}
impl ToolsToml {
    fn apply(self, t: &mut ToolsConfig) {
        if let Some(x) = self.timeout_ms {
            t.timeout_ms = x;
        }
        if let Some(x) = self.working_directory {
            t.working_directory = x;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProviderToml {
    pub kind: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}
impl ProviderToml {
    fn apply(self, p: &mut ProviderSettings) -> Result<()> {
        if let Some(x) = self.kind {
            let kind = ProviderKind::parse(&x)
                .ok_or_else(|| RelayError::Config(format!("unknown provider kind: {x}")))?;
            if kind != p.kind {
                // Switching backends resets endpoint defaults
                *p = ProviderSettings {
                    kind,
                    base_url: kind.default_base_url().to_string(),
                    model: kind.default_model().to_string(),
                    api_key: kind.key_var().and_then(env_string),
                    ..p.clone()
                };
            }
        }
        if let Some(x) = self.base_url {
            p.base_url = x;
        }
        if let Some(x) = self.model {
            p.model = x;
        }
        if let Some(x) = self.api_key {
            p.api_key = Some(x).filter(|k| !k.is_empty());
        }
        if let Some(x) = self.request_timeout_ms {
            p.request_timeout_ms = x;
        }
        if let Some(x) = self.idle_timeout_ms {
            p.idle_timeout_ms = x;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RelayConfig {
        RelayConfig {
            orchestrator: OrchestratorConfig {
                max_turns: 25,
                run_timeout_ms: 600_000,
                max_tokens: 8_192,
                system_prompt: "sys".into(),
                reasoning: None,
            },
            tools: ToolsConfig {
                timeout_ms: 30_000,
                working_directory: PathBuf::from("."),
            },
            provider: ProviderSettings {
                kind: ProviderKind::Anthropic,
                base_url: "https://api.anthropic.com".into(),
                model: "m".into(),
                api_key: Some("k".into()),
                request_timeout_ms: 30_000,
                idle_timeout_ms: 120_000,
            },
        }
    }

    #[test]
    fn overlay_applies_partial_sections() {
        let cfg = RelayConfig::overlay_str(
            base(),
            r#"
            [orchestrator]
            max_turns = 3
            reasoning_effort = "high"

            [tools]
            working_directory = "/tmp/project"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.orchestrator.max_turns, 3);
        assert_eq!(cfg.orchestrator.max_tokens, 8_192);
        assert_eq!(
            cfg.orchestrator.reasoning,
            Some(Reasoning::Effort(ReasoningEffort::High))
        );
        assert_eq!(cfg.tools.working_directory, PathBuf::from("/tmp/project"));
        assert_eq!(cfg.provider.model, "m");
    }

    #[test]
    fn switching_provider_kind_resets_endpoint() {
        let cfg = RelayConfig::overlay_str(
            base(),
            r#"
            [provider]
            kind = "ollama"
            model = "qwen3"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.provider.kind, ProviderKind::Ollama);
        assert_eq!(cfg.provider.base_url, "http://localhost:11434");
        assert_eq!(cfg.provider.model, "qwen3");
    }

    #[test]
    fn rejects_zero_turns_and_unknown_kind() {
        assert!(matches!(
            RelayConfig::overlay_str(base(), "[orchestrator]\nmax_turns = 0"),
            Err(RelayError::Config(_))
        ));
        assert!(matches!(
            RelayConfig::overlay_str(base(), "[provider]\nkind = \"bogus\""),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn request_options_follow_config() {
        let opts = base().orchestrator.request_options();
        assert_eq!(opts.system, "sys");
        assert_eq!(opts.max_tokens, 8_192);
        assert!(opts.tools.is_empty());
    }
}
