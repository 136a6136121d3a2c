//! Per-revision build directories under `<state-dir>/builds/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::core::build_type::BuildType;
use crate::io::build_status::BuildStatus;

#[derive(Debug, Clone, Serialize)]
pub struct BuildMeta {
    pub revision: String,
    pub build_type: BuildType,
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub command: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BuildPaths {
    pub dir: PathBuf,
    /// Base directory handed to the build subprocess.
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
    pub meta_path: PathBuf,
}

impl BuildPaths {
    pub fn new(builds_dir: &Path, build_type: BuildType, revision: &str) -> Self {
        let dir = builds_dir
            .join(build_type.to_string())
            .join(sanitize(revision));
        Self {
            work_dir: dir.join("work"),
            log_path: dir.join("build.log"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    /// Remove leftovers of an earlier attempt and create a fresh work directory.
    pub fn prepare(&self) -> Result<()> {
        if self.dir.exists() {
            debug!(dir = %self.dir.display(), "removing stale build directory");
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("remove stale build dir {}", self.dir.display()))?;
        }
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("create build dir {}", self.work_dir.display()))
    }
}

/// Write the build log and metadata. The log is written first so a reader
/// seeing `meta.json` can rely on the log being complete.
pub fn write_build_record(paths: &BuildPaths, log: &[u8], meta: &BuildMeta) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create build dir {}", paths.dir.display()))?;
    fs::write(&paths.log_path, log).with_context(|| format!("write {}", paths.log_path.display()))?;
    let mut buf = serde_json::to_string_pretty(meta).context("serialize build meta")?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf).with_context(|| format!("write {}", paths.meta_path.display()))
}

/// Replace everything but ASCII alphanumerics, `-` and `.` with `_`.
pub(crate) fn sanitize(name: &str) -> String {
    name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
