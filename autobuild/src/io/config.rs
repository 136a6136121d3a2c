//! CI agent configuration stored under `<state-dir>/ci.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::io::scm::RetryPolicy;

/// Which revisions a find-once pass builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindPolicy {
    /// Build only the newest discovered revision; older ones are recorded as superseded.
    #[default]
    Newest,
    /// Build every discovered revision, oldest first.
    All,
}

/// CI agent configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values suitable for an unattended agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CiConfig {
    /// Sleep after an iteration that found nothing to build.
    pub pause_secs: u64,

    /// Sleep after an iteration that built something.
    pub busy_pause_secs: u64,

    /// Sleep after an iteration whose revision discovery failed.
    pub error_pause_secs: u64,

    /// Wall-clock limit for one build subprocess.
    pub build_timeout_secs: u64,

    /// Maximum number of revisions built per iteration.
    pub build_cap: usize,

    /// Truncate captured build output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub find_policy: FindPolicy,

    /// Skip commits carrying the ignore marker.
    pub honor_ignore_marker: bool,

    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            initial_backoff: Duration::from_millis(self.backoff_ms),
            factor: self.backoff_factor,
        }
    }
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            pause_secs: 5 * 60,
            busy_pause_secs: 5,
            error_pause_secs: 15 * 60,
            build_timeout_secs: 24 * 60 * 60,
            build_cap: 8,
            output_limit_bytes: 1_000_000,
            find_policy: FindPolicy::Newest,
            honor_ignore_marker: true,
            retry: RetryConfig::default(),
        }
    }
}

impl CiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.build_timeout_secs == 0 {
            return Err(invalid("build_timeout_secs must be > 0"));
        }
        if self.build_cap == 0 {
            return Err(invalid("build_cap must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(invalid("output_limit_bytes must be > 0"));
        }
        if self.retry.attempts == 0 {
            return Err(invalid("retry.attempts must be > 0"));
        }
        if self.retry.backoff_factor == 0 {
            return Err(invalid("retry.backoff_factor must be > 0"));
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

fn invalid(message: &str) -> anyhow::Error {
    Error::configuration(format!("ci config: {message}")).into()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CiConfig::default()`.
pub fn load_config(path: &Path) -> Result<CiConfig> {
    if !path.exists() {
        let cfg = CiConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CiConfig = toml::from_str(&contents)
        .map_err(|err| Error::configuration(format!("parse {}: {err}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CiConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
