//! Layout of the CI agent's state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::io::build_log::sanitize;

/// All canonical paths within a CI state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub history_path: PathBuf,
    pub builds_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl StatePaths {
    /// A relative `root` is resolved against the current directory so the
    /// paths stay valid for subprocesses with another working directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            config_path: root.join("ci.toml"),
            checkpoint_path: root.join("checkpoint.json"),
            history_path: root.join("status.jsonl"),
            builds_dir: root.join("builds"),
            cache_dir: root.join("cache"),
            root,
        }
    }

    /// State of one project under `<root>/<project>`. The agent's `ci.toml`
    /// stays shared.
    pub fn for_project(&self, project: &str) -> Self {
        let mut paths = Self::new(self.root.join(sanitize(project)));
        paths.config_path = self.config_path.clone();
        paths
    }

    /// Create the directories the agent writes into.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.builds_dir, &self.cache_dir] {
            create_dir(dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))
}
