//! The project build file (`autobuild.toml`).
//!
//! Everything the build script sets up is declared here: the project, its
//! settings and step switches, environments, configurations and plugins.
//! Loading produces a frozen [`Project`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::build_type::{BuildType, BuildTypeEntry};
use crate::core::environment::Environment;
use crate::core::score::ScoreFormat;
use crate::core::steps::StepKind;
use crate::error::Error;
use crate::plugin::{DEFAULT_ACTION_TIMEOUT, ScmCheckout, ShellCommand, ShellPlugin, ToolCheck};
use crate::project::{Configuration, Project};

/// Environment used by configurations that do not name one.
pub const DEFAULT_ENVIRONMENT: &str = "default";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildFile {
    project: ProjectSection,
    #[serde(default)]
    settings: BTreeMap<String, toml::Value>,
    #[serde(default)]
    step_switch: Vec<StepSwitch>,
    #[serde(default)]
    build_type: Vec<BuildTypeSection>,
    #[serde(default)]
    environment: Vec<EnvironmentSection>,
    #[serde(default)]
    configuration: Vec<ConfigurationSection>,
    #[serde(default)]
    plugin: Vec<PluginSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectSection {
    name: String,
    version: Option<String>,
    scm: String,
    branch: Option<String>,
    /// Add the built-in source checkout plugin.
    #[serde(default = "default_true")]
    checkout: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepSwitch {
    step: String,
    /// Empty means every build type in the table.
    #[serde(default)]
    build_types: Vec<String>,
    enabled: Option<bool>,
    best_effort: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildTypeSection {
    code: String,
    name: String,
    marker: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentSection {
    name: String,
    /// Tool name to version-text regex.
    #[serde(default)]
    require: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigurationSection {
    name: String,
    environment: Option<String>,
    #[serde(default)]
    plugin: Vec<PluginSection>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandSection {
    Argv(Vec<String>),
    Detailed {
        argv: Vec<String>,
        #[serde(default)]
        non_fatal: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PluginSection {
    name: String,
    #[serde(default)]
    optional: bool,
    /// Program run at preflight to check the version.
    tool: Option<String>,
    version_args: Option<Vec<String>>,
    #[serde(default)]
    expected_code: i32,
    expect_output: Option<String>,
    #[serde(default)]
    search_paths: Vec<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    score_format: ScoreFormat,
    output_limit_bytes: Option<usize>,
    #[serde(default)]
    checkout: Vec<CommandSection>,
    #[serde(default)]
    configure: Vec<CommandSection>,
    #[serde(default)]
    make: Vec<CommandSection>,
    #[serde(default)]
    install: Vec<CommandSection>,
    #[serde(default)]
    test: Vec<CommandSection>,
    #[serde(default)]
    package: Vec<CommandSection>,
    #[serde(default)]
    upload: Vec<CommandSection>,
    #[serde(default)]
    cleanup: Vec<CommandSection>,
}

fn default_true() -> bool {
    true
}

/// Read and load a build file. A missing file is a configuration error.
pub fn load_build_file(path: &Path) -> Result<Project> {
    if !path.exists() {
        return Err(Error::configuration(format!(
            "build file {} not found",
            path.display()
        ))
        .into());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_build_file(&contents).with_context(|| format!("load {}", path.display()))
}

/// Every `*.toml` file in `dir`, sorted by path.
pub fn control_dir_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::configuration(format!(
            "control directory {} does not exist",
            dir.display()
        ))
        .into());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A build file the CI agent accepted.
pub struct CheckedBuildFile {
    pub path: PathBuf,
    pub project: Project,
}

/// Load each build file, keeping those that load and whose project name is
/// not already taken. The others are logged and left out.
pub fn check_build_files(paths: &[PathBuf]) -> Vec<CheckedBuildFile> {
    let mut accepted: Vec<CheckedBuildFile> = Vec::new();
    for path in paths {
        let project = match load_build_file(path) {
            Ok(project) => project,
            Err(err) => {
                warn!(file = %path.display(), err = %format!("{err:#}"), "build file disregarded");
                continue;
            }
        };
        if accepted
            .iter()
            .any(|file| file.project.name() == project.name())
        {
            warn!(
                file = %path.display(),
                project = project.name(),
                "project already watched, build file disregarded"
            );
            continue;
        }
        accepted.push(CheckedBuildFile {
            path: path.clone(),
            project,
        });
    }
    accepted
}

pub fn parse_build_file(contents: &str) -> Result<Project> {
    let file: BuildFile = toml::from_str(contents)
        .map_err(|err| Error::configuration(format!("parse build file: {err}")))?;

    let mut project = Project::new(&file.project.name, &file.project.scm)?;
    if let Some(version) = &file.project.version {
        project.set_version(version)?;
    }
    if let Some(branch) = &file.project.branch {
        project.set_branch(branch)?;
    }

    let mut table = project.build_types().clone();
    for section in &file.build_type {
        let code: BuildType = section.code.parse()?;
        table = table.with_entry(BuildTypeEntry::new(
            code,
            &section.name,
            Some(section.marker.as_str()),
        ))?;
    }
    let codes: Vec<BuildType> = table.entries().iter().map(|entry| entry.code).collect();
    project.set_build_types(table)?;

    let settings = project.settings_mut()?;
    for (key, value) in &file.settings {
        let value = match value {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        settings.set_named(key, value)?;
    }
    for switch in &file.step_switch {
        let step = StepKind::parse(&switch.step)?;
        let build_types = if switch.build_types.is_empty() {
            codes.clone()
        } else {
            switch
                .build_types
                .iter()
                .map(|code| code.parse())
                .collect::<Result<Vec<BuildType>>>()?
        };
        if let Some(enabled) = switch.enabled {
            for build_type in &build_types {
                settings.set_step_enabled(step, *build_type, enabled);
            }
        }
        if let Some(best_effort) = switch.best_effort {
            settings.set_step_best_effort(step.name(), best_effort)?;
        }
    }

    if file.environment.is_empty() {
        project.add_environment(Environment::new(DEFAULT_ENVIRONMENT))?;
    }
    for section in &file.environment {
        let mut environment = Environment::new(&section.name);
        for (tool, pattern) in &section.require {
            environment = environment
                .require(tool, pattern)
                .map_err(|err| Error::configuration(format!("{err:#}")))?;
        }
        project.add_environment(environment)?;
    }

    if file.project.checkout {
        let checkout = ScmCheckout::new(project.scm().clone(), project.branch());
        project.add_plugin(Box::new(checkout))?;
    }
    for section in file.plugin {
        project.add_plugin(Box::new(shell_plugin(section)?))?;
    }

    for section in file.configuration {
        let environment = section
            .environment
            .as_deref()
            .unwrap_or(DEFAULT_ENVIRONMENT);
        let mut configuration = Configuration::new(&section.name, environment);
        for plugin in section.plugin {
            configuration.add_plugin(Box::new(shell_plugin(plugin)?))?;
        }
        project.add_configuration(configuration)?;
    }

    project.freeze();
    debug!(
        project = project.name(),
        configurations = project.configurations().len(),
        "build file loaded"
    );
    Ok(project)
}

fn shell_plugin(section: PluginSection) -> Result<ShellPlugin> {
    let mut plugin = ShellPlugin::new(&section.name)
        .optional(section.optional)
        .search_paths(section.search_paths)
        .timeout(
            section
                .timeout_secs
                .map_or(DEFAULT_ACTION_TIMEOUT, Duration::from_secs),
        )
        .score_format(section.score_format);
    if let Some(program) = &section.tool {
        let mut tool = ToolCheck::new(program);
        if let Some(args) = section.version_args {
            tool.version_args = args;
        }
        tool.expected_code = section.expected_code;
        tool.expect_output = section.expect_output;
        plugin = plugin.tool(tool);
    }
    for (key, value) in &section.env {
        plugin = plugin.env(key, value);
    }
    if let Some(limit) = section.output_limit_bytes {
        plugin = plugin.output_limit(limit);
    }
    let steps = [
        (StepKind::ScmCheckout, section.checkout),
        (StepKind::ConfConfigure, section.configure),
        (StepKind::ConfMake, section.make),
        (StepKind::ConfMakeInstall, section.install),
        (StepKind::ConfTest, section.test),
        (StepKind::ConfPackage, section.package),
        (StepKind::ProjectUploadPackages, section.upload),
        (StepKind::ProjectCleanup, section.cleanup),
    ];
    for (step, commands) in steps {
        for command in commands {
            let command = match command {
                CommandSection::Argv(argv) => ShellCommand {
                    argv,
                    non_fatal: false,
                },
                CommandSection::Detailed { argv, non_fatal } => ShellCommand { argv, non_fatal },
            };
            plugin = plugin.command(step, command)?;
        }
    }
    Ok(plugin)
}
