//! Toolchain constraints deciding whether a configuration can run on this host.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;

/// Version text reported by each tool available on the host, keyed by tool name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostToolchains {
    versions: BTreeMap<String, String>,
}

impl HostToolchains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: &str, version_text: &str) -> Self {
        self.insert(tool, version_text);
        self
    }

    pub fn insert(&mut self, tool: &str, version_text: &str) {
        self.versions
            .insert(tool.to_string(), version_text.trim().to_string());
    }

    pub fn version_of(&self, tool: &str) -> Option<&str> {
        self.versions.get(tool).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ToolRequirement {
    pub tool: String,
    pub pattern: Regex,
}

/// Named set of toolchain patterns. Read-only once built.
#[derive(Debug, Clone)]
pub struct Environment {
    name: String,
    requirements: Vec<ToolRequirement>,
}

/// Why an environment does not match the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    MissingTool(String),
    VersionMismatch { tool: String, found: String, pattern: String },
}

impl Environment {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requirements: Vec::new(),
        }
    }

    /// Require `tool`'s version text to match `pattern`.
    pub fn require(mut self, tool: &str, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).with_context(|| {
            format!(
                "environment {}: invalid pattern for {tool}: {pattern}",
                self.name
            )
        })?;
        self.requirements.push(ToolRequirement {
            tool: tool.to_string(),
            pattern,
        });
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tools whose version text must be known to evaluate this environment.
    pub fn required_tools(&self) -> impl Iterator<Item = &str> {
        self.requirements.iter().map(|req| req.tool.as_str())
    }

    /// Every mismatch against `host`; empty means the environment is runnable.
    pub fn mismatches(&self, host: &HostToolchains) -> Vec<Mismatch> {
        self.requirements
            .iter()
            .filter_map(|req| match host.version_of(&req.tool) {
                None => Some(Mismatch::MissingTool(req.tool.clone())),
                Some(found) if !req.pattern.is_match(found) => Some(Mismatch::VersionMismatch {
                    tool: req.tool.clone(),
                    found: found.to_string(),
                    pattern: req.pattern.as_str().to_string(),
                }),
                Some(_) => None,
            })
            .collect()
    }

    pub fn matches(&self, host: &HostToolchains) -> bool {
        self.mismatches(host).is_empty()
    }
}
