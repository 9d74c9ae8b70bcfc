//! formlogic configuration stored as TOML (`formlogic.toml` by default).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::orchestrator::PassOptions;
use crate::core::shim::LookupPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "formlogic.toml";

/// formlogic configuration (TOML).
///
/// Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FormlogicConfig {
    pub lookup: LookupConfig,
    pub task: TaskConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LookupConfig {
    /// `lenient` (first suffix match wins) or `strict` (ambiguity is an error).
    pub policy: LookupPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    /// Deadline for a worker to answer, in milliseconds.
    pub timeout_ms: u64,

    /// Keep at most this many bytes of worker stderr.
    pub stderr_limit_bytes: usize,

    /// Longest response line a worker may write.
    pub response_limit_bytes: usize,

    /// Worker command line. Empty means `<current executable> worker`.
    pub worker_command: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            stderr_limit_bytes: 64 * 1024,
            response_limit_bytes: 16 * 1024 * 1024,
            worker_command: Vec::new(),
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the worker program and its arguments.
    pub fn worker_program(&self) -> Result<(PathBuf, Vec<String>)> {
        match self.worker_command.split_first() {
            Some((program, args)) => Ok((PathBuf::from(program), args.to_vec())),
            None => {
                let exe = std::env::current_exe().context("locate current executable")?;
                Ok((exe, vec!["worker".to_string()]))
            }
        }
    }
}

impl FormlogicConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task.timeout_ms == 0 {
            return Err(anyhow!("task.timeout_ms must be > 0"));
        }
        if self.task.stderr_limit_bytes == 0 {
            return Err(anyhow!("task.stderr_limit_bytes must be > 0"));
        }
        if self.task.response_limit_bytes == 0 {
            return Err(anyhow!("task.response_limit_bytes must be > 0"));
        }
        if self
            .task
            .worker_command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("task.worker_command must start with a program"));
        }
        Ok(())
    }

    pub fn pass_options(&self) -> PassOptions {
        PassOptions {
            lookup_policy: self.lookup.policy,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FormlogicConfig::default()`.
pub fn load_config(path: &Path) -> Result<FormlogicConfig> {
    if !path.exists() {
        let cfg = FormlogicConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FormlogicConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FormlogicConfig) -> Result<()> {
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
