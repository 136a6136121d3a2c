//! One build of a project and its runnable configurations, and the driver
//! that picks those configurations for the host.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::core::build_type::BuildType;
use crate::core::environment::{HostToolchains, Mismatch};
use crate::core::settings::{SettingKey, Settings};
use crate::core::steps::StepKind;
use crate::pipeline::{
    ActionResult, CancelToken, Failure, Pipeline, PipelineEvent, PipelineOutcome, PipelineReport,
    PlanScope,
};
use crate::plugin::{PlanContext, Plugin, participating_steps};
use crate::project::{BuildDirs, Configuration, Project};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Created,
    PreflightChecked,
    Running(StepKind),
    Completed { success: bool },
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Created => f.write_str("created"),
            BuildState::PreflightChecked => f.write_str("preflight-checked"),
            BuildState::Running(step) => write!(f, "running {step}"),
            BuildState::Completed { success: true } => f.write_str("completed (success)"),
            BuildState::Completed { success: false } => f.write_str("completed (failed)"),
        }
    }
}

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub build_type: BuildType,
    /// `None` builds the source provider's head.
    pub revision: Option<String>,
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Configurations built, in declaration order.
    pub configurations: Vec<String>,
    pub log_dir: PathBuf,
    pub pipeline: PipelineReport,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.pipeline.succeeded()
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.pipeline.outcome {
            PipelineOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// The project itself, or one configuration, with the plugins attached there.
struct Scope<'p> {
    configuration: Option<&'p str>,
    dirs: BuildDirs,
    plugins: Vec<&'p dyn Plugin>,
}

impl Scope<'_> {
    fn context<'a>(
        &'a self,
        project: &'a str,
        build_type: BuildType,
        revision: Option<&'a str>,
        settings: &'a Settings,
    ) -> PlanContext<'a> {
        PlanContext {
            project,
            configuration: self.configuration,
            build_type,
            revision,
            dirs: &self.dirs,
            settings,
        }
    }

    /// Step logs of configurations go to their own subdirectory.
    fn log_dir(&self) -> PathBuf {
        match self.configuration {
            Some(name) => self.dirs.log.join(name),
            None => self.dirs.log.clone(),
        }
    }
}

/// A single-use build of a project and the configurations chosen for it.
///
/// Every step runs the project's own plugins once, then each
/// configuration's plugins in order.
///
/// `Created -> PreflightChecked -> Running(step).. -> Completed`. Actions are
/// planned in [`Build::new`]; nothing touches the filesystem before
/// [`Build::execute`].
pub struct Build<'p> {
    project_name: &'p str,
    settings: Settings,
    build_type: BuildType,
    revision: Option<String>,
    scopes: Vec<Scope<'p>>,
    pipeline: Pipeline,
    state: BuildState,
    cancel: CancelToken,
}

impl<'p> Build<'p> {
    /// `settings` is this build's own copy; later changes to the project's
    /// settings do not affect it.
    pub fn new(
        project: &'p Project,
        configurations: &[&'p Configuration],
        mut settings: Settings,
        request: &BuildRequest,
        cancel: CancelToken,
    ) -> Result<Self> {
        settings.set(SettingKey::ProjectBuildType, request.build_type.to_string());
        if let Some(revision) = &request.revision {
            settings.set(SettingKey::ProjectRevision, revision.as_str());
        }
        let project_dirs = BuildDirs::project(&request.base_dir, &settings)?;
        let configuration_scopes = configurations
            .iter()
            .map(|&configuration| {
                Ok(Scope {
                    configuration: Some(configuration.name()),
                    dirs: BuildDirs::configuration(&project_dirs, configuration.name(), &settings)?,
                    plugins: configuration.plugins().collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut scopes = vec![Scope {
            configuration: None,
            dirs: project_dirs,
            plugins: project.plugins().collect(),
        }];
        scopes.extend(configuration_scopes);

        let pipeline = {
            let plan: Vec<PlanScope<'_>> = scopes
                .iter()
                .map(|scope| PlanScope {
                    plugins: scope.plugins.clone(),
                    ctx: scope.context(
                        project.name(),
                        request.build_type,
                        request.revision.as_deref(),
                        &settings,
                    ),
                })
                .collect();
            Pipeline::plan(&settings, request.build_type, &plan)
                .with_context(|| format!("plan project '{}'", project.name()))?
        };
        Ok(Self {
            project_name: project.name(),
            build_type: request.build_type,
            revision: request.revision.clone(),
            settings,
            scopes,
            pipeline,
            state: BuildState::Created,
            cancel,
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    fn configuration_names(&self) -> Vec<String> {
        self.scopes
            .iter()
            .filter_map(|scope| scope.configuration.map(str::to_string))
            .collect()
    }

    /// Run every participating plugin's preflight check.
    ///
    /// Plugins whose steps are all disabled are not checked. An optional
    /// plugin that fails is dropped from the pipeline; any other failure
    /// completes the build as failed.
    #[instrument(skip_all, fields(project = %self.project_name))]
    pub fn preflight(&mut self) -> Result<()> {
        if self.state != BuildState::Created {
            bail!("cannot preflight a build that is {}", self.state);
        }
        let plugins = self
            .scopes
            .iter()
            .flat_map(|scope| scope.plugins.iter().map(move |plugin| (scope, *plugin)));
        for (idx, (scope, plugin)) in plugins.enumerate() {
            let active = participating_steps(plugin)
                .into_iter()
                .any(|step| self.pipeline.is_step_enabled(step));
            if !active {
                info!(plugin = plugin.name(), "plugin has no enabled steps, preflight skipped");
                continue;
            }
            let ctx = scope.context(
                self.project_name,
                self.build_type,
                self.revision.as_deref(),
                &self.settings,
            );
            if let Err(err) = plugin.preflight_check(&ctx) {
                if plugin.is_optional() {
                    warn!(plugin = plugin.name(), err = %format!("{err:#}"), "optional plugin disabled");
                    self.pipeline.disable_plugin(idx);
                    continue;
                }
                self.state = BuildState::Completed { success: false };
                return Err(err.context(format!(
                    "preflight check of plugin '{}' failed",
                    plugin.name()
                )));
            }
        }
        self.state = BuildState::PreflightChecked;
        Ok(())
    }

    /// Execute the planned pipeline. Only valid after a successful preflight.
    #[instrument(skip_all, fields(project = %self.project_name, build_type = %self.build_type))]
    pub fn execute(&mut self) -> Result<BuildReport> {
        match self.state {
            BuildState::PreflightChecked => {}
            BuildState::Completed { .. } => {
                bail!("build of '{}' already completed; start a new build", self.project_name)
            }
            state => bail!("cannot execute a build that is {state}"),
        }
        let log_dirs: Vec<PathBuf> = self.scopes.iter().map(Scope::log_dir).collect();
        for scope in &self.scopes {
            for dir in scope.dirs.all() {
                fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            }
        }
        for dir in &log_dirs {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }

        let state = &mut self.state;
        let report = self.pipeline.execute(&self.cancel, &mut |event| match event {
            PipelineEvent::StepStarted(step) => *state = BuildState::Running(*step),
            PipelineEvent::ActionFinished {
                step,
                scope,
                plugin,
                action,
                result,
            } => {
                if let Err(err) = append_step_log(
                    &log_dirs[*scope],
                    *step,
                    plugin,
                    &action.describe(),
                    action.stdout(),
                    action.stderr(),
                    result,
                ) {
                    warn!(step = %step, err = %format!("{err:#}"), "failed to write step log");
                }
            }
            PipelineEvent::StepFinished(..) => {}
        });
        self.state = BuildState::Completed {
            success: report.succeeded(),
        };
        info!(outcome = ?report.outcome, "build completed");
        Ok(BuildReport {
            configurations: self.configuration_names(),
            log_dir: self.scopes[0].dirs.log.clone(),
            pipeline: report,
        })
    }

    /// Preflight then execute.
    pub fn run(mut self) -> Result<BuildReport> {
        self.preflight()?;
        self.execute()
    }
}

fn append_step_log(
    log_dir: &Path,
    step: StepKind,
    plugin: &str,
    description: &str,
    stdout: &[u8],
    stderr: &[u8],
    result: &ActionResult,
) -> Result<()> {
    let path = log_dir.join(format!("{step}.log"));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "[{plugin}] $ {description}")?;
    file.write_all(stdout)?;
    file.write_all(stderr)?;
    writeln!(file, "[{plugin}] => {result:?}")?;
    Ok(())
}

/// A configuration left out because the host does not satisfy its
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedConfiguration {
    pub configuration: String,
    pub mismatches: Vec<Mismatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectReport {
    pub skipped: Vec<SkippedConfiguration>,
    /// `None` when the project has configurations and none is runnable.
    pub build: Option<BuildReport>,
}

impl ProjectReport {
    pub fn succeeded(&self) -> bool {
        self.build.as_ref().is_some_and(BuildReport::succeeded)
    }

    pub fn first_failure(&self) -> Option<&Failure> {
        self.build.as_ref().and_then(BuildReport::failure)
    }
}

/// Build the project together with every configuration whose environment
/// matches `host`, on a copy of the project's settings.
#[instrument(skip_all, fields(project = project.name(), build_type = %request.build_type))]
pub fn build_project(
    project: &Project,
    host: &HostToolchains,
    request: &BuildRequest,
    cancel: &CancelToken,
) -> Result<ProjectReport> {
    let mut report = ProjectReport::default();
    let mut runnable = Vec::new();
    for configuration in project.configurations() {
        let mismatches = project.runnable_mismatches(configuration, host)?;
        if mismatches.is_empty() {
            runnable.push(configuration);
            continue;
        }
        warn!(
            configuration = configuration.name(),
            mismatches = ?mismatches,
            "environment does not match host, configuration skipped"
        );
        report.skipped.push(SkippedConfiguration {
            configuration: configuration.name().to_string(),
            mismatches,
        });
    }
    if runnable.is_empty() && !project.configurations().is_empty() {
        warn!("no configuration is runnable on this host");
        return Ok(report);
    }
    let build = Build::new(
        project,
        &runnable,
        project.settings().clone(),
        request,
        cancel.clone(),
    )?;
    report.build = Some(build.run()?);
    Ok(report)
}
