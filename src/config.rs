//! Configuration loading and validation.
//!
//! Reads `toolweave.yaml` (JSON is accepted too, being a YAML subset) and
//! resolves environment variables. One file describes the tool servers, the
//! model parameters used for completions, and the agent loop limits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::{McpError, RetryPolicy, ServerConfig};

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "toolweave.yaml";

/// Env var that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "TOOLWEAVE_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Tool servers keyed by name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl AppConfig {
    /// Check every server entry has what its transport needs.
    pub fn validate(&self) -> Result<(), McpError> {
        for (name, server) in &self.servers {
            server.validate(name)?;
        }
        Ok(())
    }
}

/// Parameters passed with every chat-completion request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            top_p: None,
            max_tokens: None,
        }
    }
}

impl ModelConfig {
    /// Reasoning models return chain-of-thought that must not be re-sent.
    pub fn is_reasoner(&self) -> bool {
        self.model.to_lowercase().contains("reasoner")
    }
}

/// Limits for the tool-calling loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard cap on model ↔ tool rounds per `process_and_continue`.
    pub max_tool_rounds: usize,
    /// Per-request timeout for MCP calls.
    pub request_timeout_secs: u64,
    /// Outstanding tool-call bookkeeping older than this is swept.
    pub tool_call_max_age_secs: u64,
    /// Tool results longer than this are truncated before reaching the model.
    pub max_tool_result_chars: usize,
    /// Backoff for capability refreshes.
    pub refresh: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            request_timeout_secs: 30,
            tool_call_max_age_secs: 300,
            max_tool_result_chars: 6_000,
            refresh: RetryPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tool_call_max_age(&self) -> Duration {
        Duration::from_secs(self.tool_call_max_age_secs)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLWEAVE_CONFIG` first, then searches upward from `start` for
/// `toolweave.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse, and validate a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<AppConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        model = %config.model.model,
        "loaded config"
    );
    Ok(config)
}

/// Parse config text (YAML or JSON).
pub fn parse_config(raw: &str) -> Result<AppConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    let config: AppConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
