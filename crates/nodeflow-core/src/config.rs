use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NodeflowError, Result};
use crate::types::Kwargs;

/// Top-level nodeflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// One of `sync`, `async`, `distributed`, `async_distributed`.
    /// Validated when a run starts.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Submit the whole run as a single job instead of one job per node.
    #[serde(default)]
    pub same_worker: bool,
    /// Extra metadata merged into every submitted job.
    #[serde(default)]
    pub meta: Kwargs,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            same_worker: false,
            meta: Kwargs::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_mode() -> String {
    "sync".to_string()
}

fn default_queue_name() -> String {
    "default".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| NodeflowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| NodeflowError::Config(e.to_string()))
    }
}

/// Replace `${VAR}` with the variable's value and `${VAR:-fallback}` with
/// the value or `fallback`. Unset variables without a fallback stay as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let body = &after[..close];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => out.push_str(&rest[open..open + 3 + close]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.runner.mode, "sync");
        assert!(!config.runner.same_worker);
        assert!(config.runner.meta.is_empty());
        assert_eq!(config.queue.name, "default");
        assert!(config.log.filter.is_none());
    }

    #[test]
    fn expands_set_vars_and_keeps_unset() {
        std::env::set_var("NODEFLOW_CONFIG_TEST_MODE", "distributed");
        let out = expand_env_vars("mode = \"${NODEFLOW_CONFIG_TEST_MODE}\" # ${NODEFLOW_UNSET_VAR_X}");
        assert_eq!(out, "mode = \"distributed\" # ${NODEFLOW_UNSET_VAR_X}");
    }

    #[test]
    fn unset_var_uses_fallback() {
        let out = expand_env_vars("name = \"${NODEFLOW_UNSET_VAR_Y:-math}\" ${unterminated");
        assert_eq!(out, "name = \"math\" ${unterminated");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = AppConfig::parse("[runner\nmode = 1").unwrap_err();
        assert!(matches!(err, NodeflowError::Config(_)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = AppConfig::load(Path::new("/nonexistent/nodeflow.toml")).unwrap_err();
        assert!(matches!(err, NodeflowError::ConfigNotFound(_)));
    }
}
