//! Engine configuration stored under `.taskloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::{MIN_PROMPT_BUDGET_TOKENS, prompt_budget};
use crate::core::state::RuntimeConfig;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".taskloop/config.toml";

/// Engine configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of step records per task.
    pub max_iterations: u32,

    /// Planner context window, in estimated tokens.
    pub context_window_tokens: usize,

    /// Fraction of the context window the prompt may occupy.
    pub prompt_budget_ratio: f64,

    /// History entries kept verbatim when the prompt is compressed.
    pub history_keep: usize,

    /// Restrict execution to tools marked safe.
    pub safe_mode: bool,

    /// Timeout for tools that do not declare one.
    pub default_tool_timeout_secs: u64,

    /// Retry count for tools that do not declare one.
    pub default_tool_retries: u32,

    /// Directory holding one provenance record per task.
    pub audit_dir: PathBuf,

    /// Directory scanned for command tool manifests (`*.toml`).
    pub plugins_dir: PathBuf,

    pub planner: PlannerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Completion command; receives the request JSON on stdin.
    pub command: Vec<String>,

    pub timeout_secs: u64,

    /// Truncate completion output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm-complete".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            context_window_tokens: 8192,
            prompt_budget_ratio: 0.8,
            history_keep: 3,
            safe_mode: true,
            default_tool_timeout_secs: 30,
            default_tool_retries: 0,
            audit_dir: PathBuf::from(".taskloop/audit"),
            plugins_dir: PathBuf::from(".taskloop/tools.d"),
            planner: PlannerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.context_window_tokens == 0 {
            return Err(anyhow!("context_window_tokens must be > 0"));
        }
        if !(self.prompt_budget_ratio > 0.0 && self.prompt_budget_ratio <= 1.0) {
            return Err(anyhow!("prompt_budget_ratio must be in (0, 1]"));
        }
        let budget = self.runtime().prompt_budget_tokens;
        if budget < MIN_PROMPT_BUDGET_TOKENS {
            return Err(anyhow!(
                "prompt budget {budget} tokens (context_window_tokens * prompt_budget_ratio) is below the minimum {MIN_PROMPT_BUDGET_TOKENS}"
            ));
        }
        if self.default_tool_timeout_secs == 0 {
            return Err(anyhow!("default_tool_timeout_secs must be > 0"));
        }
        if self.planner.command.is_empty() || self.planner.command[0].trim().is_empty() {
            return Err(anyhow!("planner.command must be a non-empty array"));
        }
        if self.planner.timeout_secs == 0 {
            return Err(anyhow!("planner.timeout_secs must be > 0"));
        }
        if self.planner.output_limit_bytes == 0 {
            return Err(anyhow!("planner.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Per-task runtime configuration carried in the task state.
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_iterations: self.max_iterations,
            context_window_tokens: self.context_window_tokens,
            prompt_budget_tokens: prompt_budget(
                self.context_window_tokens,
                self.prompt_budget_ratio,
            ),
            history_keep: self.history_keep,
            safe_mode: self.safe_mode,
        }
    }

    pub fn default_tool_timeout(&self) -> Duration {
        Duration::from_secs(self.default_tool_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let cfg = EngineConfig {
            max_iterations: 7,
            safe_mode: false,
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 4\n[planner]\ncommand = [\"echo\"]\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 4);
        assert_eq!(cfg.planner.command, vec!["echo".to_string()]);
        assert_eq!(cfg.planner.timeout_secs, 120);
        assert_eq!(cfg.history_keep, 3);
    }

    #[test]
    fn rejects_invalid_values() {
        let zero_cap = EngineConfig {
            max_iterations: 0,
            ..EngineConfig::default()
        };
        assert!(zero_cap.validate().is_err());

        let bad_ratio = EngineConfig {
            prompt_budget_ratio: 1.5,
            ..EngineConfig::default()
        };
        assert!(bad_ratio.validate().is_err());

        let mut no_planner = EngineConfig::default();
        no_planner.planner.command.clear();
        assert!(no_planner.validate().is_err());
    }

    #[test]
    fn rejects_prompt_budget_below_minimum() {
        let tiny_window = EngineConfig {
            context_window_tokens: 5,
            ..EngineConfig::default()
        };
        let err = tiny_window.validate().expect_err("tiny window");
        assert!(err.to_string().contains("below the minimum"));

        let at_floor = EngineConfig {
            context_window_tokens: MIN_PROMPT_BUDGET_TOKENS,
            prompt_budget_ratio: 1.0,
            ..EngineConfig::default()
        };
        assert!(at_floor.validate().is_ok());

        let under_floor = EngineConfig {
            context_window_tokens: MIN_PROMPT_BUDGET_TOKENS * 2,
            prompt_budget_ratio: 0.45,
            ..EngineConfig::default()
        };
        assert!(under_floor.validate().is_err());
    }

    #[test]
    fn runtime_budget_is_ratio_of_window() {
        let cfg = EngineConfig {
            context_window_tokens: 1000,
            prompt_budget_ratio: 0.8,
            ..EngineConfig::default()
        };
        let runtime = cfg.runtime();
        assert_eq!(runtime.prompt_budget_tokens, 800);
        assert_eq!(runtime.max_iterations, cfg.max_iterations);
        assert!(runtime.safe_mode);
    }
}
