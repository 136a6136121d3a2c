//! Plugins and their capability roles.
//!
//! A plugin may take any number of roles. The pipeline asks each plugin for
//! its roles through the `as_*` accessors and collects actions per step; it
//! never inspects concrete plugin types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::action::{PlannedAction, ShellAction};
use crate::core::build_type::BuildType;
use crate::core::descriptor::{ScmDescriptor, ScmKind};
use crate::core::score::ScoreFormat;
use crate::core::settings::Settings;
use crate::core::steps::StepKind;
use crate::error::Error;
use crate::io::process::CommandRunner;
use crate::project::BuildDirs;

/// Default deadline for a single plugin command.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

/// What plugins see while planning and preflighting one build scope.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub project: &'a str,
    /// `None` for project-wide plugins.
    pub configuration: Option<&'a str>,
    pub build_type: BuildType,
    /// `None` builds whatever the source provider considers its head.
    pub revision: Option<&'a str>,
    pub dirs: &'a BuildDirs,
    pub settings: &'a Settings,
}

impl PlanContext<'_> {
    /// Substitute `{placeholder}` names in a command argument. Unknown
    /// placeholders are left as written.
    pub fn expand(&self, template: &str) -> String {
        let substitutions = [
            ("{source_dir}", path_str(&self.dirs.source)),
            ("{build_dir}", path_str(&self.dirs.build)),
            ("{target_dir}", path_str(&self.dirs.target)),
            ("{packages_dir}", path_str(&self.dirs.packages)),
            ("{log_dir}", path_str(&self.dirs.log)),
            ("{revision}", self.revision.unwrap_or("HEAD").to_string()),
            ("{build_type}", self.build_type.to_string()),
            ("{project}", self.project.to_string()),
            ("{configuration}", self.configuration.unwrap_or_default().to_string()),
        ];
        substitutions
            .iter()
            .fold(template.to_string(), |acc, (name, value)| {
                acc.replace(name, value)
            })
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub trait SourceProvider {
    fn create_checkout_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>>;
}

pub trait Builder {
    fn create_configure_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>>;
    fn create_make_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>>;
    fn create_install_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>>;
}

pub trait TestProvider {
    fn create_test_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>>;
}

pub trait PackageProvider {
    fn create_package_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>>;
}

pub trait Publisher {
    fn create_upload_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>>;
}

/// Extension point for tool adapters.
pub trait Plugin {
    fn name(&self) -> &str;

    /// Optional plugins that fail preflight are disabled instead of failing the build.
    fn is_optional(&self) -> bool {
        false
    }

    /// Absolute path of the tool this plugin drives, if it drives one.
    fn resolve_command(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Cheap validation before any action runs. The default only resolves the tool.
    fn preflight_check(&self, _ctx: &PlanContext<'_>) -> Result<()> {
        self.resolve_command().map(|_| ())
    }

    fn as_source_provider(&self) -> Option<&dyn SourceProvider> {
        None
    }

    fn as_builder(&self) -> Option<&dyn Builder> {
        None
    }

    fn as_test_provider(&self) -> Option<&dyn TestProvider> {
        None
    }

    fn as_package_provider(&self) -> Option<&dyn PackageProvider> {
        None
    }

    fn as_publisher(&self) -> Option<&dyn Publisher> {
        None
    }

    fn has_cleanup(&self) -> bool {
        false
    }

    fn create_cleanup_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        Ok(Vec::new())
    }
}

/// Steps `plugin` contributes to, in pipeline order.
pub fn participating_steps(plugin: &dyn Plugin) -> Vec<StepKind> {
    StepKind::ALL
        .into_iter()
        .filter(|step| match step {
            StepKind::ScmCheckout => plugin.as_source_provider().is_some(),
            StepKind::ConfConfigure | StepKind::ConfMake | StepKind::ConfMakeInstall => {
                plugin.as_builder().is_some()
            }
            StepKind::ConfTest => plugin.as_test_provider().is_some(),
            StepKind::ConfPackage => plugin.as_package_provider().is_some(),
            StepKind::ProjectUploadPackages => plugin.as_publisher().is_some(),
            StepKind::ProjectCleanup => plugin.has_cleanup(),
        })
        .collect()
}

/// Ask `plugin` for its actions in `step`. Plugins without the matching role
/// contribute nothing.
pub fn actions_for(
    plugin: &dyn Plugin,
    step: StepKind,
    ctx: &PlanContext<'_>,
) -> Result<Vec<PlannedAction>> {
    let actions = match step {
        StepKind::ScmCheckout => plugin
            .as_source_provider()
            .map(|role| role.create_checkout_actions(ctx)),
        StepKind::ConfConfigure => plugin
            .as_builder()
            .map(|role| role.create_configure_actions(ctx)),
        StepKind::ConfMake => plugin.as_builder().map(|role| role.create_make_actions(ctx)),
        StepKind::ConfMakeInstall => plugin
            .as_builder()
            .map(|role| role.create_install_actions(ctx)),
        StepKind::ConfTest => plugin
            .as_test_provider()
            .map(|role| role.create_test_actions(ctx)),
        StepKind::ConfPackage => plugin
            .as_package_provider()
            .map(|role| role.create_package_actions(ctx)),
        StepKind::ProjectUploadPackages => plugin
            .as_publisher()
            .map(|role| role.create_upload_actions(ctx)),
        StepKind::ProjectCleanup => Some(plugin.create_cleanup_actions(ctx)),
    };
    actions
        .transpose()
        .with_context(|| format!("plan {step} actions of plugin '{}'", plugin.name()))
        .map(Option::unwrap_or_default)
}

/// Version check a [`ShellPlugin`] runs at preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCheck {
    pub program: String,
    pub version_args: Vec<String>,
    pub expected_code: i32,
    /// Substring the version output must contain, e.g. a product name.
    pub expect_output: Option<String>,
}

impl ToolCheck {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            version_args: vec!["--version".to_string()],
            expected_code: 0,
            expect_output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub argv: Vec<String>,
    pub non_fatal: bool,
}

/// Generic adapter that runs configured command lines per step.
///
/// Roles follow from the steps it has commands for.
#[derive(Debug, Clone)]
pub struct ShellPlugin {
    name: String,
    optional: bool,
    tool: Option<ToolCheck>,
    search_paths: Vec<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Duration,
    score_format: ScoreFormat,
    output_limit_bytes: Option<usize>,
    commands: BTreeMap<StepKind, Vec<ShellCommand>>,
}

impl ShellPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
            tool: None,
            search_paths: Vec::new(),
            env: Vec::new(),
            timeout: DEFAULT_ACTION_TIMEOUT,
            score_format: ScoreFormat::default(),
            output_limit_bytes: None,
            commands: BTreeMap::new(),
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn tool(mut self, tool: ToolCheck) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn search_paths<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_paths.extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn score_format(mut self, format: ScoreFormat) -> Self {
        self.score_format = format;
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = Some(bytes);
        self
    }

    pub fn command(mut self, step: StepKind, command: ShellCommand) -> Result<Self> {
        if command.argv.is_empty() {
            return Err(Error::configuration(format!(
                "plugin '{}' has an empty command for step {step}",
                self.name
            ))
            .into());
        }
        self.commands.entry(step).or_default().push(command);
        Ok(self)
    }

    fn has_any(&self, steps: &[StepKind]) -> bool {
        steps.iter().any(|step| self.commands.contains_key(step))
    }

    fn working_dir(step: StepKind, dirs: &BuildDirs) -> &Path {
        match step {
            StepKind::ScmCheckout | StepKind::ProjectCleanup => &dirs.base,
            StepKind::ProjectUploadPackages => &dirs.packages,
            _ => &dirs.build,
        }
    }

    fn runner(&self, argv: &[String], step: StepKind, ctx: &PlanContext<'_>) -> Result<CommandRunner> {
        let expanded: Vec<String> = argv.iter().map(|arg| ctx.expand(arg)).collect();
        let mut runner = CommandRunner::from_argv(&expanded)?
            .search_paths(self.search_paths.iter().cloned())
            .current_dir(Self::working_dir(step, ctx.dirs));
        for (key, value) in &self.env {
            runner = runner.env(key.as_str(), ctx.expand(value));
        }
        if let Some(limit) = self.output_limit_bytes {
            runner = runner.output_limit(limit);
        }
        Ok(runner)
    }

    fn actions(&self, step: StepKind, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        let Some(commands) = self.commands.get(&step) else {
            return Ok(Vec::new());
        };
        commands
            .iter()
            .map(|command| -> Result<PlannedAction> {
                let mut action = ShellAction::new(self.runner(&command.argv, step, ctx)?, self.timeout);
                if step == StepKind::ConfTest {
                    action = action.with_score_format(self.score_format);
                }
                Ok(if command.non_fatal {
                    PlannedAction::non_fatal(action)
                } else {
                    PlannedAction::fatal(action)
                })
            })
            .collect()
    }

    fn tool_runner(&self, tool: &ToolCheck) -> CommandRunner {
        CommandRunner::new(tool.program.as_str())
            .search_paths(self.search_paths.iter().cloned())
            .version_args(tool.version_args.iter().cloned())
    }
}

impl Plugin for ShellPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    fn resolve_command(&self) -> Result<Option<PathBuf>> {
        if let Some(tool) = &self.tool {
            return self.tool_runner(tool).resolve().map(Some);
        }
        let first = self
            .commands
            .values()
            .flatten()
            .filter_map(|command| command.argv.first())
            .find(|program| is_plain_program(program));
        match first {
            Some(program) => CommandRunner::new(program.as_str())
                .search_paths(self.search_paths.iter().cloned())
                .resolve()
                .map(Some),
            None => Ok(None),
        }
    }

    /// Runs the version check if configured, otherwise resolves every
    /// command's program.
    fn preflight_check(&self, ctx: &PlanContext<'_>) -> Result<()> {
        if let Some(tool) = &self.tool {
            let output = self.tool_runner(tool).check_version(tool.expected_code)?;
            if let Some(expected) = &tool.expect_output
                && !output.contains(expected.as_str())
            {
                return Err(Error::configuration(format!(
                    "tool '{}' of plugin '{}' does not report '{expected}'",
                    tool.program, self.name
                ))
                .into());
            }
            debug!(plugin = %self.name, tool = %tool.program, "tool version accepted");
            return Ok(());
        }
        for command in self.commands.values().flatten() {
            let Some(program) = command.argv.first() else {
                continue;
            };
            let program = ctx.expand(program);
            if is_plain_program(&program) {
                CommandRunner::new(program)
                    .search_paths(self.search_paths.iter().cloned())
                    .resolve()
                    .with_context(|| format!("preflight of plugin '{}'", self.name))?;
            }
        }
        Ok(())
    }

    fn as_source_provider(&self) -> Option<&dyn SourceProvider> {
        self.has_any(&[StepKind::ScmCheckout])
            .then_some(self as &dyn SourceProvider)
    }

    fn as_builder(&self) -> Option<&dyn Builder> {
        self.has_any(&[
            StepKind::ConfConfigure,
            StepKind::ConfMake,
            StepKind::ConfMakeInstall,
        ])
        .then_some(self as &dyn Builder)
    }

    fn as_test_provider(&self) -> Option<&dyn TestProvider> {
        self.has_any(&[StepKind::ConfTest])
            .then_some(self as &dyn TestProvider)
    }

    fn as_package_provider(&self) -> Option<&dyn PackageProvider> {
        self.has_any(&[StepKind::ConfPackage])
            .then_some(self as &dyn PackageProvider)
    }

    fn as_publisher(&self) -> Option<&dyn Publisher> {
        self.has_any(&[StepKind::ProjectUploadPackages])
            .then_some(self as &dyn Publisher)
    }

    fn has_cleanup(&self) -> bool {
        self.has_any(&[StepKind::ProjectCleanup])
    }

    fn create_cleanup_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ProjectCleanup, ctx)
    }
}

impl SourceProvider for ShellPlugin {
    fn create_checkout_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ScmCheckout, ctx)
    }
}

impl Builder for ShellPlugin {
    fn create_configure_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ConfConfigure, ctx)
    }

    fn create_make_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ConfMake, ctx)
    }

    fn create_install_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ConfMakeInstall, ctx)
    }
}

impl TestProvider for ShellPlugin {
    fn create_test_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ConfTest, ctx)
    }
}

impl PackageProvider for ShellPlugin {
    fn create_package_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ConfPackage, ctx)
    }
}

impl Publisher for ShellPlugin {
    fn create_upload_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.actions(StepKind::ProjectUploadPackages, ctx)
    }
}

/// Names that still need `PATH` lookup; paths and templated programs are
/// checked when they run.
fn is_plain_program(program: &str) -> bool {
    !program.contains('/') && !program.contains('{')
}

/// Source provider that checks the project's repository out into the
/// configuration's source directory.
#[derive(Debug, Clone)]
pub struct ScmCheckout {
    scm: ScmDescriptor,
    branch: Option<String>,
    timeout: Duration,
}

impl ScmCheckout {
    pub fn new(scm: ScmDescriptor, branch: Option<&str>) -> Self {
        Self {
            scm,
            branch: branch.map(str::to_string),
            timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn program(&self) -> &'static str {
        match self.scm.kind {
            ScmKind::Git => "git",
            ScmKind::Svn => "svn",
        }
    }
}

impl Plugin for ScmCheckout {
    fn name(&self) -> &str {
        "scm-checkout"
    }

    fn resolve_command(&self) -> Result<Option<PathBuf>> {
        CommandRunner::new(self.program()).resolve().map(Some)
    }

    fn as_source_provider(&self) -> Option<&dyn SourceProvider> {
        Some(self)
    }
}

impl SourceProvider for ScmCheckout {
    fn create_checkout_actions(&self, ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        let source = path_str(&ctx.dirs.source);
        let base = &ctx.dirs.base;
        let mut actions = Vec::new();
        match self.scm.kind {
            ScmKind::Git => {
                let mut clone = CommandRunner::new("git").args(["clone", "--quiet"]);
                if let Some(branch) = &self.branch {
                    clone = clone.args(["--branch", branch.as_str()]);
                }
                clone = clone
                    .args([self.scm.location.as_str(), source.as_str()])
                    .current_dir(base);
                actions.push(PlannedAction::fatal(ShellAction::new(clone, self.timeout)));
                if let Some(revision) = ctx.revision {
                    let checkout = CommandRunner::new("git")
                        .args(["-C", source.as_str(), "checkout", "--quiet", "--detach", revision])
                        .current_dir(base);
                    actions.push(PlannedAction::fatal(ShellAction::new(checkout, self.timeout)));
                }
            }
            ScmKind::Svn => {
                let mut checkout = CommandRunner::new("svn").args(["--non-interactive", "checkout"]);
                if let Some(revision) = ctx.revision {
                    checkout = checkout.args(["-r", revision]);
                }
                checkout = checkout
                    .args([self.scm.location.as_str(), source.as_str()])
                    .current_dir(base);
                actions.push(PlannedAction::fatal(ShellAction::new(checkout, self.timeout)));
            }
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_configuration;

    fn dirs() -> BuildDirs {
        let settings = Settings::new();
        let project = BuildDirs::project(Path::new("/work"), &settings).expect("project dirs");
        BuildDirs::configuration(&project, "release", &settings).expect("dirs")
    }

    fn ctx<'a>(dirs: &'a BuildDirs, settings: &'a Settings) -> PlanContext<'a> {
        PlanContext {
            project: "hello",
            configuration: Some("release"),
            build_type: BuildType::MILESTONE,
            revision: Some("abc123"),
            dirs,
            settings,
        }
    }

    fn command(argv: &[&str]) -> ShellCommand {
        ShellCommand {
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            non_fatal: false,
        }
    }

    #[test]
    fn expand_substitutes_known_placeholders_only() {
        let dirs = dirs();
        let settings = Settings::new();
        let ctx = ctx(&dirs, &settings);
        assert_eq!(
            ctx.expand("-DSRC={source_dir} -DOUT={target_dir} {unknown}"),
            "-DSRC=/work/src -DOUT=/work/release/install {unknown}"
        );
        assert_eq!(
            ctx.expand("{project}-{configuration}-{build_type}-{revision}"),
            "hello-release-m-abc123"
        );
        let head = PlanContext {
            revision: None,
            ..ctx
        };
        assert_eq!(head.expand("{revision}"), "HEAD");
        let project_wide = PlanContext {
            configuration: None,
            ..ctx
        };
        assert_eq!(project_wide.expand("[{configuration}]"), "[]");
    }

    #[test]
    fn roles_follow_configured_steps() {
        let plugin = ShellPlugin::new("cmake")
            .command(StepKind::ConfMake, command(&["make"]))
            .expect("make")
            .command(StepKind::ConfPackage, command(&["cpack"]))
            .expect("package");
        assert!(plugin.as_builder().is_some());
        assert!(plugin.as_package_provider().is_some());
        assert!(plugin.as_test_provider().is_none());
        assert!(plugin.as_source_provider().is_none());
        assert_eq!(
            participating_steps(&plugin),
            vec![
                StepKind::ConfConfigure,
                StepKind::ConfMake,
                StepKind::ConfMakeInstall,
                StepKind::ConfPackage
            ]
        );
    }

    #[test]
    fn actions_for_step_without_role_is_empty() {
        let dirs = dirs();
        let settings = Settings::new();
        let plugin = ShellPlugin::new("cpack")
            .command(StepKind::ConfPackage, command(&["cpack", "-B", "{packages_dir}"]))
            .expect("package");
        let ctx = ctx(&dirs, &settings);
        assert!(actions_for(&plugin, StepKind::ConfMake, &ctx).expect("make").is_empty());
        let actions = actions_for(&plugin, StepKind::ConfPackage, &ctx).expect("package");
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].action.describe(),
            "cpack -B /work/packages"
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = ShellPlugin::new("broken")
            .command(StepKind::ConfMake, command(&[]))
            .expect_err("empty argv");
        assert!(is_configuration(&err));
    }

    #[test]
    fn preflight_fails_for_missing_tool() {
        let dirs = dirs();
        let settings = Settings::new();
        let plugin = ShellPlugin::new("ghost")
            .command(
                StepKind::ConfMake,
                command(&["autobuild-definitely-missing-tool"]),
            )
            .expect("make");
        let err = plugin.preflight_check(&ctx(&dirs, &settings)).expect_err("missing");
        assert!(is_configuration(&err));
    }

    #[test]
    fn git_checkout_clones_then_detaches() {
        let dirs = dirs();
        let settings = Settings::new();
        let scm = ScmDescriptor::parse("git:/srv/hello").expect("scm");
        let plugin = ScmCheckout::new(scm, Some("main"));
        let actions = actions_for(&plugin, StepKind::ScmCheckout, &ctx(&dirs, &settings))
            .expect("checkout");
        let described: Vec<String> = actions.iter().map(|a| a.action.describe()).collect();
        assert_eq!(
            described,
            vec![
                "git clone --quiet --branch main /srv/hello /work/src".to_string(),
                "git -C /work/src checkout --quiet --detach abc123".to_string(),
            ]
        );
    }

    #[test]
    fn svn_checkout_pins_revision() {
        let dirs = dirs();
        let settings = Settings::new();
        let scm = ScmDescriptor::parse("svn://svn.example.org/hello/trunk").expect("scm");
        let plugin = ScmCheckout::new(scm, None);
        let ctx = PlanContext {
            revision: Some("42"),
            ..ctx(&dirs, &settings)
        };
        let actions = actions_for(&plugin, StepKind::ScmCheckout, &ctx).expect("checkout");
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].action.describe(),
            "svn --non-interactive checkout -r 42 svn://svn.example.org/hello/trunk /work/src"
        );
    }
}
