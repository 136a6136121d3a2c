//! The CI agent: discovers new revisions and builds each one in a subprocess.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::core::build_type::BuildType;
use crate::core::revision::RevisionInfo;
use crate::error::{Error as AutobuildError, is_configuration, is_timeout};
use crate::exit_codes;
use crate::io::build_log::{BuildMeta, BuildPaths, write_build_record};
use crate::io::build_status::{BuildStatus, StatusRecord, StatusStore, StatusUpdate};
use crate::io::config::{CiConfig, FindPolicy};
use crate::io::init::StatePaths;
use crate::io::process::CommandRunner;
use crate::io::scm::RevisionEngine;
use crate::pipeline::CancelToken;

/// Longest uninterrupted sleep between stop-flag checks.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// One build to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub revision: String,
    pub build_type: BuildType,
    pub work_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchResult {
    /// `None` when the build was killed.
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,
    pub timed_out: bool,
    pub command: Vec<String>,
}

/// Runs one build for the scheduler.
pub trait BuildLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchResult>;
}

/// Launches `<program> <leading args> build --type T --revision R --base-dir D`.
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    program: String,
    leading_args: Vec<String>,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }
}

impl BuildLauncher for SubprocessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchResult> {
        let work_dir = request.work_dir.to_string_lossy().into_owned();
        let runner = CommandRunner::new(self.program.as_str())
            .args(self.leading_args.iter().cloned())
            .args(["build", "--type"])
            .arg(request.build_type.to_string())
            .args(["--revision", request.revision.as_str()])
            .args(["--base-dir", work_dir.as_str()])
            .current_dir(&request.work_dir)
            .output_limit(request.output_limit_bytes);
        let command: Vec<String> = runner
            .command_line()
            .split(' ')
            .map(str::to_string)
            .collect();
        match runner.run(request.timeout) {
            Ok(output) => {
                let mut log = output.stdout.clone();
                log.extend_from_slice(&output.stderr);
                log.extend_from_slice(output.truncated_notice("build").as_bytes());
                Ok(LaunchResult {
                    exit_code: output.exit_code,
                    output: log,
                    timed_out: false,
                    command,
                })
            }
            Err(err) if is_timeout(&err) => Ok(LaunchResult {
                exit_code: None,
                output: format!("{err:#}\n").into_bytes(),
                timed_out: true,
                command,
            }),
            Err(err) => Err(err),
        }
    }
}

/// Marks failures that happened while asking the revision engine for work.
#[derive(Debug, Error)]
#[error("revision discovery failed")]
pub struct DiscoveryError;

/// What one iteration found and recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationOutcome {
    /// Revisions returned by the engine, oldest first.
    pub discovered: Vec<String>,
    pub records: Vec<StatusRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveStop {
    /// The stop flag was raised.
    Stopped,
    MaxIterations,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveSummary {
    pub iterations: u64,
    pub builds: usize,
    pub stop: SlaveStop,
}

pub struct Scheduler<'a> {
    engine: &'a dyn RevisionEngine,
    launcher: &'a dyn BuildLauncher,
    paths: StatePaths,
    store: StatusStore,
    config: CiConfig,
    stop: CancelToken,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        engine: &'a dyn RevisionEngine,
        launcher: &'a dyn BuildLauncher,
        paths: StatePaths,
        config: CiConfig,
        stop: CancelToken,
    ) -> Self {
        let store = StatusStore::new(&paths.checkpoint_path, &paths.history_path);
        Self {
            engine,
            launcher,
            paths,
            store,
            config,
            stop,
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// The revision to resume after.
    ///
    /// A fresh agent records `since` (or the engine's current revision) as
    /// its initial checkpoint and builds nothing for it.
    pub fn initialize(&self, since: Option<&str>) -> Result<String> {
        if let Some(checkpoint) = self.store.load_checkpoint()? {
            info!(revision = %checkpoint.revision, seq = checkpoint.seq, "resuming from checkpoint");
            return Ok(checkpoint.revision);
        }
        let (revision, build_type) = match since {
            Some(revision) => (revision.to_string(), BuildType::CONTINUOUS),
            None => {
                let current = self.engine.current_revision().context(DiscoveryError)?;
                (current.revision().to_string(), current.build_type())
            }
        };
        let record = self.store.record(StatusUpdate::new(
            &revision,
            build_type,
            BuildStatus::Initial,
        ))?;
        info!(revision = %record.revision, "initial checkpoint recorded");
        Ok(record.revision)
    }

    fn discover(&self, checkpoint: &str, count: Option<usize>) -> Result<Vec<RevisionInfo>> {
        let revisions = self
            .engine
            .revisions_since(checkpoint, count)
            .context(DiscoveryError)?;
        info!(checkpoint, found = revisions.len(), "discovered revisions");
        Ok(revisions)
    }

    /// Query once and build per the find policy.
    ///
    /// `Newest` builds the last discovered revision and records the others as
    /// superseded; `All` builds up to the build cap, oldest first.
    #[instrument(skip_all, fields(policy = ?self.config.find_policy))]
    pub fn find_once(&self, since: Option<&str>) -> Result<IterationOutcome> {
        let checkpoint = self.initialize(since)?;
        let revisions = self.discover(&checkpoint, None)?;
        let mut outcome = IterationOutcome {
            discovered: revisions.iter().map(|r| r.revision().to_string()).collect(),
            records: Vec::new(),
        };
        match self.config.find_policy {
            FindPolicy::Newest => {
                if let Some((newest, older)) = revisions.split_last() {
                    for info in older {
                        outcome.records.push(self.store.record(StatusUpdate::new(
                            info.revision(),
                            info.build_type(),
                            BuildStatus::Superseded,
                        ))?);
                    }
                    outcome.records.push(self.process_revision(newest)?);
                }
            }
            FindPolicy::All => {
                for info in revisions.iter().take(self.config.build_cap) {
                    if self.stop.is_cancelled() {
                        break;
                    }
                    outcome.records.push(self.process_revision(info)?);
                }
            }
        }
        Ok(outcome)
    }

    /// Build every revision after `checkpoint`, oldest first, up to the cap.
    #[instrument(skip_all, fields(checkpoint = %checkpoint))]
    pub fn poll_once(&self, checkpoint: &str) -> Result<IterationOutcome> {
        let revisions = self.discover(checkpoint, Some(self.config.build_cap))?;
        let mut outcome = IterationOutcome {
            discovered: revisions.iter().map(|r| r.revision().to_string()).collect(),
            records: Vec::new(),
        };
        for info in &revisions {
            if self.stop.is_cancelled() {
                warn!("stop requested, remaining revisions left for the next run");
                break;
            }
            outcome.records.push(self.process_revision(info)?);
        }
        Ok(outcome)
    }

    /// Build (or skip) one revision and record the outcome. A failing build is
    /// recorded like any other; only state-directory failures are errors.
    #[instrument(skip_all, fields(revision = %info.revision(), build_type = %info.build_type()))]
    pub fn process_revision(&self, info: &RevisionInfo) -> Result<StatusRecord> {
        if self.config.honor_ignore_marker && info.requests_skip() {
            info!("commit asks to be ignored, skipping");
            return self.store.record(StatusUpdate::new(
                info.revision(),
                info.build_type(),
                BuildStatus::Skipped,
            ));
        }

        let (meta, paths) = self.launch_build(info.revision(), info.build_type())?;
        self.store.record(StatusUpdate {
            exit_code: meta.exit_code,
            duration: Some(Duration::from_millis(meta.duration_ms)),
            log_path: Some(paths.log_path),
            ..StatusUpdate::new(info.revision(), info.build_type(), meta.status)
        })
    }

    /// Build the engine's current revision as a snapshot.
    ///
    /// The build directory and its log are written as usual, but neither the
    /// history nor the checkpoint changes.
    #[instrument(skip_all)]
    pub fn test_build(&self) -> Result<BuildMeta> {
        let current = self.engine.current_revision().context(DiscoveryError)?;
        info!(revision = %current.revision(), "test build of the current revision");
        let (meta, _) = self.launch_build(current.revision(), BuildType::SNAPSHOT)?;
        Ok(meta)
    }

    /// Launch one build in a fresh `<builds>/<type>/<revision>` directory and
    /// write its log and metadata there.
    fn launch_build(
        &self,
        revision: &str,
        build_type: BuildType,
    ) -> Result<(BuildMeta, BuildPaths)> {
        let paths = BuildPaths::new(&self.paths.builds_dir, build_type, revision);
        paths.prepare()?;
        let request = LaunchRequest {
            revision: revision.to_string(),
            build_type,
            work_dir: paths.work_dir.clone(),
            timeout: self.config.build_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let started_at = Utc::now();
        let started = Instant::now();
        let (status, exit_code, output, command) = match self.launcher.launch(&request) {
            Ok(result) => {
                let status = if result.timed_out || result.exit_code == Some(exit_codes::TIMEOUT) {
                    BuildStatus::TimedOut
                } else if result.exit_code == Some(exit_codes::OK) {
                    BuildStatus::Passed
                } else {
                    BuildStatus::Failed
                };
                (status, result.exit_code, result.output, result.command)
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "build could not be launched");
                (
                    BuildStatus::Error,
                    None,
                    format!("{err:#}\n").into_bytes(),
                    Vec::new(),
                )
            }
        };
        let duration = started.elapsed();
        match status {
            BuildStatus::Passed => info!(duration_ms = duration.as_millis() as u64, "build passed"),
            _ => warn!(status = ?status, exit_code = ?exit_code, "build did not pass"),
        }

        let meta = BuildMeta {
            revision: revision.to_string(),
            build_type,
            status,
            exit_code,
            command,
            started_at,
            ended_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        };
        write_build_record(&paths, &output, &meta)?;
        Ok((meta, paths))
    }

    /// Poll and build until stopped or `max_iterations` have run.
    ///
    /// Discovery failures pause for `error_pause_secs` and try again, except
    /// configuration errors which end the loop.
    pub fn run_slave(
        &self,
        since: Option<&str>,
        max_iterations: Option<u64>,
        mut on_iteration: impl FnMut(&IterationOutcome),
    ) -> Result<SlaveSummary> {
        run_slaves(std::slice::from_ref(self), since, max_iterations, |_, outcome| {
            on_iteration(outcome);
        })
    }

    /// Sleep for `duration`, waking early when the stop flag is raised.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || self.stop.is_cancelled() {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Poll several projects in turn until stopped or `max_iterations` have run.
///
/// Each iteration polls every scheduler once. A discovery failure of one
/// project is logged and the others still build; the iteration then pauses
/// for `error_pause_secs`. Pauses and the stop flag come from the first
/// scheduler. `on_iteration` receives the scheduler's index.
pub fn run_slaves(
    schedulers: &[Scheduler<'_>],
    since: Option<&str>,
    max_iterations: Option<u64>,
    mut on_iteration: impl FnMut(usize, &IterationOutcome),
) -> Result<SlaveSummary> {
    let Some(lead) = schedulers.first() else {
        return Err(AutobuildError::configuration("no build files to watch").into());
    };
    let mut checkpoints = schedulers
        .iter()
        .map(|scheduler| scheduler.initialize(since))
        .collect::<Result<Vec<_>>>()?;
    let mut iterations = 0u64;
    let mut builds = 0usize;
    loop {
        if lead.stop.is_cancelled() {
            return Ok(SlaveSummary {
                iterations,
                builds,
                stop: SlaveStop::Stopped,
            });
        }
        if max_iterations.is_some_and(|max| iterations >= max) {
            return Ok(SlaveSummary {
                iterations,
                builds,
                stop: SlaveStop::MaxIterations,
            });
        }
        iterations += 1;

        let mut built = 0usize;
        let mut discovery_failed = false;
        let polled = schedulers.iter().zip(&mut checkpoints).enumerate();
        for (idx, (scheduler, checkpoint)) in polled {
            if lead.stop.is_cancelled() {
                break;
            }
            match scheduler.poll_once(checkpoint) {
                Ok(outcome) => {
                    on_iteration(idx, &outcome);
                    if let Some(last) = outcome.records.last() {
                        *checkpoint = last.revision.clone();
                    }
                    built += outcome.records.len();
                }
                Err(err)
                    if err.downcast_ref::<DiscoveryError>().is_some() && !is_configuration(&err) =>
                {
                    error!(err = %format!("{err:#}"), "revision discovery failed, will retry");
                    discovery_failed = true;
                }
                Err(err) => return Err(err),
            }
        }
        builds += built;
        let pause_secs = if discovery_failed {
            lead.config.error_pause_secs
        } else if built > 0 {
            lead.config.busy_pause_secs
        } else {
            lead.config.pause_secs
        };

        if max_iterations.is_some_and(|max| iterations >= max) {
            continue;
        }
        lead.pause(Duration::from_secs(pause_secs));
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::build_status::latest_for;
    use crate::test_support::{ScriptedEngine, ScriptedLauncher, launch_exit, revision};

    fn config() -> CiConfig {
        CiConfig {
            pause_secs: 0,
            busy_pause_secs: 0,
            error_pause_secs: 0,
            ..CiConfig::default()
        }
    }

    fn engine() -> ScriptedEngine {
        ScriptedEngine::new(vec![
            revision("r0", "initial import"),
            revision("r1", "fix parser"),
            revision("r2", "[milestone] 1.0"),
            revision("r3", "docs\n\nAUTOBUILD_IGNORE"),
        ])
    }

    #[test]
    fn fresh_agent_records_current_revision_as_initial() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let launcher = ScriptedLauncher::new(vec![]);
        let scheduler = Scheduler::new(
            &engine,
            &launcher,
            StatePaths::new(temp.path()),
            config(),
            CancelToken::new(),
        );
        assert_eq!(scheduler.initialize(None).expect("init"), "r3");
        let history = scheduler.store().history().expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BuildStatus::Initial);
        assert!(launcher.requests().is_empty());
    }

    #[test]
    fn slave_builds_in_order_and_advances_past_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let launcher = ScriptedLauncher::new(vec![launch_exit(2), launch_exit(0)]);
        let scheduler = Scheduler::new(
            &engine,
            &launcher,
            StatePaths::new(temp.path()),
            config(),
            CancelToken::new(),
        );
        let mut seen = Vec::new();
        let summary = scheduler
            .run_slave(Some("r0"), Some(2), |outcome| seen.push(outcome.clone()))
            .expect("slave");
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.stop, SlaveStop::MaxIterations);
        assert_eq!(seen[0].discovered, vec!["r1", "r2", "r3"]);
        assert!(seen[1].records.is_empty());

        let requests = launcher.requests();
        let built: Vec<&str> = requests.iter().map(|r| r.revision.as_str()).collect();
        assert_eq!(built, vec!["r1", "r2"]);
        assert_eq!(requests[1].build_type, BuildType::MILESTONE);

        let history = scheduler.store().history().expect("history");
        assert_eq!(latest_for(&history, "r1").expect("r1").status, BuildStatus::Failed);
        assert_eq!(latest_for(&history, "r2").expect("r2").status, BuildStatus::Passed);
        assert_eq!(latest_for(&history, "r3").expect("r3").status, BuildStatus::Skipped);
        let checkpoint = scheduler
            .store()
            .load_checkpoint()
            .expect("load")
            .expect("checkpoint");
        assert_eq!(checkpoint.revision, "r3");

        let r1 = latest_for(&history, "r1").expect("r1");
        let log_path = r1.log_path.as_ref().expect("log path");
        assert_eq!(fs::read_to_string(log_path).expect("log"), "exit 2\n");
        assert!(log_path.with_file_name("meta.json").exists());
    }

    #[test]
    fn restart_resumes_from_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let first = ScriptedLauncher::new(vec![launch_exit(0)]);
        let config = CiConfig {
            build_cap: 1,
            ..config()
        };
        let scheduler = Scheduler::new(
            &engine,
            &first,
            StatePaths::new(temp.path()),
            config.clone(),
            CancelToken::new(),
        );
        scheduler.run_slave(Some("r0"), Some(1), |_| {}).expect("first run");
        assert_eq!(first.requests().len(), 1);

        let second = ScriptedLauncher::new(vec![launch_exit(0)]);
        let scheduler = Scheduler::new(
            &engine,
            &second,
            StatePaths::new(temp.path()),
            config,
            CancelToken::new(),
        );
        scheduler
            .run_slave(Some("ignored"), Some(1), |_| {})
            .expect("second run");
        let built: Vec<String> = second.requests().into_iter().map(|r| r.revision).collect();
        assert_eq!(built, vec!["r2"]);
    }

    #[test]
    fn find_once_newest_supersedes_older_revisions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::new(vec![
            revision("r0", "initial import"),
            revision("r1", "fix parser"),
            revision("r2", "[milestone] 1.0"),
        ]);
        let launcher = ScriptedLauncher::new(vec![launch_exit(0)]);
        let scheduler = Scheduler::new(
            &engine,
            &launcher,
            StatePaths::new(temp.path()),
            config(),
            CancelToken::new(),
        );
        let outcome = scheduler.find_once(Some("r0")).expect("find once");
        assert_eq!(outcome.discovered, vec!["r1", "r2"]);
        let statuses: Vec<BuildStatus> = outcome.records.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![BuildStatus::Superseded, BuildStatus::Passed]);
        assert_eq!(launcher.requests().len(), 1);
    }

    #[test]
    fn timeouts_and_launch_errors_are_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = ScriptedEngine::new(vec![
            revision("r0", "initial import"),
            revision("r1", "hang"),
            revision("r2", "broken launcher"),
            revision("r3", "exit with timeout code"),
        ]);
        let launcher = ScriptedLauncher::new(vec![
            Ok(LaunchResult {
                exit_code: None,
                output: Vec::new(),
                timed_out: true,
                command: vec!["autobuild".to_string()],
            }),
            Err(anyhow::anyhow!("spawn failed")),
            launch_exit(exit_codes::TIMEOUT),
        ]);
        let scheduler = Scheduler::new(
            &engine,
            &launcher,
            StatePaths::new(temp.path()),
            config(),
            CancelToken::new(),
        );
        let outcome = scheduler.poll_once("r0").expect("poll");
        let statuses: Vec<BuildStatus> = outcome.records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![BuildStatus::TimedOut, BuildStatus::Error, BuildStatus::TimedOut]
        );
    }

    #[test]
    fn discovery_failure_pauses_instead_of_exiting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine().failing_discovery(1);
        let launcher = ScriptedLauncher::new(vec![launch_exit(0), launch_exit(0)]);
        let scheduler = Scheduler::new(
            &engine,
            &launcher,
            StatePaths::new(temp.path()),
            config(),
            CancelToken::new(),
        );
        let summary = scheduler
            .run_slave(Some("r0"), Some(2), |_| {})
            .expect("slave");
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.builds, 3);
    }

    #[test]
    fn stop_flag_ends_loop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let launcher = ScriptedLauncher::new(vec![]);
        let stop = CancelToken::new();
        stop.cancel();
        let scheduler = Scheduler::new(
            &engine,
            &launcher,
            StatePaths::new(temp.path()),
            config(),
            stop,
        );
        let summary = scheduler.run_slave(Some("r3"), None, |_| {}).expect("slave");
        assert_eq!(summary.stop, SlaveStop::Stopped);
        assert_eq!(summary.iterations, 0);
    }

    #[test]
    fn slaves_keep_separate_state_per_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = StatePaths::new(temp.path());
        let hello_engine = ScriptedEngine::new(vec![
            revision("r0", "initial import"),
            revision("r1", "fix parser"),
        ]);
        let world_engine = ScriptedEngine::new(vec![
            revision("w0", "initial import"),
            revision("w1", "first feature"),
            revision("w2", "second feature"),
        ]);
        let hello_launcher = ScriptedLauncher::new(vec![launch_exit(0)]);
        let world_launcher = ScriptedLauncher::new(vec![launch_exit(0)]);
        let schedulers = [
            Scheduler::new(
                &hello_engine,
                &hello_launcher,
                root.for_project("hello"),
                config(),
                CancelToken::new(),
            ),
            Scheduler::new(
                &world_engine,
                &world_launcher,
                root.for_project("world"),
                config(),
                CancelToken::new(),
            ),
        ];
        let mut seen = Vec::new();
        let summary = run_slaves(&schedulers, None, Some(1), |idx, outcome| {
            seen.push((idx, outcome.records.len()));
        })
        .expect("slaves");
        assert_eq!(summary.iterations, 1);
        assert_eq!(seen, vec![(0, 0), (1, 0)]);

        hello_engine.push(revision("r2", "more fixes"));
        world_engine.push(revision("w3", "third feature"));
        let summary = run_slaves(&schedulers, None, Some(1), |_, _| {}).expect("slaves");
        assert_eq!(summary.builds, 2);

        let hello = schedulers[0].store().load_checkpoint().expect("load").expect("hello");
        let world = schedulers[1].store().load_checkpoint().expect("load").expect("world");
        assert_eq!(hello.revision, "r2");
        assert_eq!(world.revision, "w3");
        assert!(temp.path().join("hello/builds/c/r2/build.log").is_file());
        assert!(temp.path().join("world/builds/c/w3/meta.json").is_file());
    }

    #[test]
    fn test_build_uses_snapshot_type_and_keeps_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let launcher = ScriptedLauncher::new(vec![launch_exit(0)]);
        let scheduler = Scheduler::new(
            &engine,
            &launcher,
            StatePaths::new(temp.path()),
            config(),
            CancelToken::new(),
        );
        scheduler.initialize(Some("r1")).expect("init");

        let meta = scheduler.test_build().expect("test build");
        assert_eq!(meta.revision, "r3");
        assert_eq!(meta.build_type, BuildType::SNAPSHOT);
        assert_eq!(meta.status, BuildStatus::Passed);
        assert_eq!(launcher.requests()[0].build_type, BuildType::SNAPSHOT);
        assert!(temp.path().join("builds/s/r3/build.log").is_file());

        let checkpoint = scheduler
            .store()
            .load_checkpoint()
            .expect("load")
            .expect("checkpoint");
        assert_eq!(checkpoint.revision, "r1");
        assert_eq!(scheduler.store().history().expect("history").len(), 1);
    }
}
