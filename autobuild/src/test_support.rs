//! Test-only helpers: real git repositories, scripts, and scripted stand-ins
//! for plugins, revision engines and build launchers.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::action::{Action, PlannedAction};
use crate::core::build_type::BuildTypeTable;
use crate::core::descriptor::ScmKind;
use crate::core::revision::{CommitFields, RevisionInfo};
use crate::core::steps::StepKind;
use crate::error::Error;
use crate::io::git::Git;
use crate::io::scm::RevisionEngine;
use crate::pipeline::CancelToken;
use crate::plugin::{
    Builder, PackageProvider, PlanContext, Plugin, Publisher, SourceProvider, TestProvider,
};
use crate::scheduler::{BuildLauncher, LaunchRequest, LaunchResult};

/// Write an executable `#!/bin/sh` script and return its path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(path)
}

/// A throwaway git repository with a committer identity configured.
pub struct TestRepo {
    _temp: TempDir,
    git: Git,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let git = Git::new(temp.path().join("repo"));
        git.init()?;
        git.set_config("user.name", "Autobuild Test")?;
        git.set_config("user.email", "autobuild@example.org")?;
        git.set_config("commit.gpgsign", "false")?;
        Ok(Self { _temp: temp, git })
    }

    pub fn path(&self) -> &Path {
        self.git.workdir()
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Commit a change to `history.txt` and return the new SHA.
    pub fn commit(&self, message: &str) -> Result<String> {
        let file = self.path().join("history.txt");
        let mut contents = fs::read_to_string(&file).unwrap_or_default();
        contents.push_str(message);
        contents.push('\n');
        fs::write(&file, contents).with_context(|| format!("write {}", file.display()))?;
        self.git.add_all()?;
        self.git.commit(message)
    }
}

/// Shared, ordered record of which scripted actions ran.
#[derive(Debug, Clone, Default)]
pub struct ActionLog(Rc<RefCell<Vec<String>>>);

impl ActionLog {
    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    fn push(&self, label: &str) {
        self.0.borrow_mut().push(label.to_string());
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Exit(i32),
    /// Raise the token, then succeed.
    Cancel(CancelToken),
}

/// An action that records its label and returns a fixed result.
pub struct ScriptedAction {
    label: String,
    behavior: Behavior,
    log: ActionLog,
    stdout: Vec<u8>,
}

impl Action for ScriptedAction {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn run(&mut self) -> Result<i32> {
        self.log.push(&self.label);
        self.stdout = format!("{} output\n", self.label).into_bytes();
        match &self.behavior {
            Behavior::Exit(code) => Ok(*code),
            Behavior::Cancel(token) => {
                token.cancel();
                Ok(0)
            }
        }
    }

    fn stdout(&self) -> &[u8] {
        &self.stdout
    }
}

struct StaticAction {
    step: StepKind,
    label: String,
    behavior: Behavior,
    non_fatal: bool,
}

/// Plugin with a fixed list of actions per step. Its roles follow from the
/// steps it has actions for.
pub struct StaticPlugin {
    name: String,
    optional: bool,
    log: ActionLog,
    actions: Vec<StaticAction>,
    preflight_error: Option<String>,
    preflight_calls: Rc<Cell<usize>>,
    planned: RefCell<Vec<StepKind>>,
}

impl StaticPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
            log: ActionLog::default(),
            actions: Vec::new(),
            preflight_error: None,
            preflight_calls: Rc::new(Cell::new(0)),
            planned: RefCell::new(Vec::new()),
        }
    }

    pub fn with_log(mut self, log: &ActionLog) -> Self {
        self.log = log.clone();
        self
    }

    pub fn action(self, step: StepKind, label: &str, code: i32) -> Self {
        self.push(step, label, Behavior::Exit(code), false)
    }

    pub fn non_fatal_action(self, step: StepKind, label: &str, code: i32) -> Self {
        self.push(step, label, Behavior::Exit(code), true)
    }

    /// An action that raises `token` while running.
    pub fn cancelling_action(self, step: StepKind, label: &str, token: &CancelToken) -> Self {
        self.push(step, label, Behavior::Cancel(token.clone()), false)
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn failing_preflight(mut self, message: &str) -> Self {
        self.preflight_error = Some(message.to_string());
        self
    }

    pub fn preflight_counter(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.preflight_calls)
    }

    /// Steps this plugin was asked to plan actions for, in order.
    pub fn planned_steps(&self) -> Vec<StepKind> {
        self.planned.borrow().clone()
    }

    fn push(mut self, step: StepKind, label: &str, behavior: Behavior, non_fatal: bool) -> Self {
        self.actions.push(StaticAction {
            step,
            label: label.to_string(),
            behavior,
            non_fatal,
        });
        self
    }

    fn has(&self, steps: &[StepKind]) -> bool {
        self.actions.iter().any(|action| steps.contains(&action.step))
    }

    fn planned_for(&self, step: StepKind) -> Result<Vec<PlannedAction>> {
        self.planned.borrow_mut().push(step);
        Ok(self
            .actions
            .iter()
            .filter(|action| action.step == step)
            .map(|action| PlannedAction {
                action: Box::new(ScriptedAction {
                    label: action.label.clone(),
                    behavior: action.behavior.clone(),
                    log: self.log.clone(),
                    stdout: Vec::new(),
                }),
                non_fatal: action.non_fatal,
            })
            .collect())
    }
}

impl Plugin for StaticPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    fn preflight_check(&self, _ctx: &PlanContext<'_>) -> Result<()> {
        self.preflight_calls.set(self.preflight_calls.get() + 1);
        match &self.preflight_error {
            Some(message) => Err(Error::configuration(message.clone()).into()),
            None => Ok(()),
        }
    }

    fn as_source_provider(&self) -> Option<&dyn SourceProvider> {
        self.has(&[StepKind::ScmCheckout])
            .then_some(self as &dyn SourceProvider)
    }

    fn as_builder(&self) -> Option<&dyn Builder> {
        self.has(&[
            StepKind::ConfConfigure,
            StepKind::ConfMake,
            StepKind::ConfMakeInstall,
        ])
        .then_some(self as &dyn Builder)
    }

    fn as_test_provider(&self) -> Option<&dyn TestProvider> {
        self.has(&[StepKind::ConfTest])
            .then_some(self as &dyn TestProvider)
    }

    fn as_package_provider(&self) -> Option<&dyn PackageProvider> {
        self.has(&[StepKind::ConfPackage])
            .then_some(self as &dyn PackageProvider)
    }

    fn as_publisher(&self) -> Option<&dyn Publisher> {
        self.has(&[StepKind::ProjectUploadPackages])
            .then_some(self as &dyn Publisher)
    }

    fn has_cleanup(&self) -> bool {
        self.has(&[StepKind::ProjectCleanup])
    }

    fn create_cleanup_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ProjectCleanup)
    }
}

impl SourceProvider for StaticPlugin {
    fn create_checkout_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ScmCheckout)
    }
}

impl Builder for StaticPlugin {
    fn create_configure_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ConfConfigure)
    }

    fn create_make_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ConfMake)
    }

    fn create_install_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ConfMakeInstall)
    }
}

impl TestProvider for StaticPlugin {
    fn create_test_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ConfTest)
    }
}

impl PackageProvider for StaticPlugin {
    fn create_package_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ConfPackage)
    }
}

impl Publisher for StaticPlugin {
    fn create_upload_actions(&self, _ctx: &PlanContext<'_>) -> Result<Vec<PlannedAction>> {
        self.planned_for(StepKind::ProjectUploadPackages)
    }
}

/// A revision classified with the standard build-type table.
pub fn revision(id: &str, message: &str) -> RevisionInfo {
    let build_type = BuildTypeTable::standard().classify(message);
    RevisionInfo::new(
        CommitFields {
            revision: id.to_string(),
            short_revision: id.to_string(),
            committer: "Autobuild Test".to_string(),
            committer_email: None,
            message: message.to_string(),
            timestamp: Utc::now(),
        },
        build_type,
    )
}

/// In-memory revision history, oldest first.
pub struct ScriptedEngine {
    history: RefCell<Vec<RevisionInfo>>,
    failures_left: Cell<usize>,
}

impl ScriptedEngine {
    pub fn new(history: Vec<RevisionInfo>) -> Self {
        Self {
            history: RefCell::new(history),
            failures_left: Cell::new(0),
        }
    }

    /// Append a new head revision.
    pub fn push(&self, info: RevisionInfo) {
        self.history.borrow_mut().push(info);
    }

    /// Fail the next `count` discovery calls as an unreachable server would.
    pub fn failing_discovery(self, count: usize) -> Self {
        self.failures_left.set(count);
        self
    }
}

impl RevisionEngine for ScriptedEngine {
    fn kind(&self) -> ScmKind {
        ScmKind::Git
    }

    fn current_revision(&self) -> Result<RevisionInfo> {
        self.history
            .borrow()
            .last()
            .cloned()
            .ok_or_else(|| Error::build("empty history").into())
    }

    fn revisions_since(&self, revision: &str, count: Option<usize>) -> Result<Vec<RevisionInfo>> {
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            return Err(Error::build("fetch failed after 3 attempts: connection reset").into());
        }
        let history = self.history.borrow();
        let idx = history
            .iter()
            .position(|info| info.revision() == revision)
            .ok_or_else(|| Error::build(format!("unknown revision '{revision}'")))?;
        Ok(history[idx + 1..]
            .iter()
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

/// A successful launch that exited with `code`.
pub fn launch_exit(code: i32) -> Result<LaunchResult> {
    Ok(LaunchResult {
        exit_code: Some(code),
        output: format!("exit {code}\n").into_bytes(),
        timed_out: false,
        command: vec!["autobuild".to_string(), "build".to_string()],
    })
}

/// Hands out queued launch results and remembers every request.
pub struct ScriptedLauncher {
    results: RefCell<VecDeque<Result<LaunchResult>>>,
    requests: RefCell<Vec<LaunchRequest>>,
}

impl ScriptedLauncher {
    pub fn new(results: Vec<Result<LaunchResult>>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.borrow().clone()
    }
}

impl BuildLauncher for ScriptedLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchResult> {
        self.requests.borrow_mut().push(request.clone());
        self.results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted launch left for {}", request.revision)))
    }
}
