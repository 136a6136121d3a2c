//! `autobuild` command-line front end.
//!
//! Loads the project build file, then queries settings, prints revisions,
//! builds the project or runs the CI agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use autobuild::build::{BuildRequest, ProjectReport, build_project};
use autobuild::core::build_type::BuildType;
use autobuild::core::settings::SettingKey;
use autobuild::error::Error;
use autobuild::exit_codes;
use autobuild::io::build_file::{
    CheckedBuildFile, check_build_files, control_dir_files, load_build_file,
};
use autobuild::io::build_status::{BuildStatus, StatusRecord};
use autobuild::io::config::{CiConfig, load_config};
use autobuild::io::init::StatePaths;
use autobuild::io::scm::{EngineOptions, RevisionEngine, engine_for};
use autobuild::io::toolchain::detect_toolchains;
use autobuild::logging;
use autobuild::pipeline::{ActionResult, CancelToken, PipelineOutcome};
use autobuild::project::Project;
use autobuild::query::{format_revision, query_setting};
use autobuild::scheduler::{Scheduler, SubprocessLauncher, run_slaves};

#[derive(Parser)]
#[command(
    name = "autobuild",
    version,
    about = "Build automation and continuous integration engine"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Project build file.
    #[arg(long, global = true, default_value = "autobuild.toml")]
    file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print `key: value` for a setting or `step.<name>.<type>` switch.
    Query { key: String },
    /// Print revisions of the project's repository.
    Print {
        /// Directory holding the repository mirror.
        #[arg(long, global = true, default_value = ".autobuild")]
        state_dir: PathBuf,
        #[command(subcommand)]
        what: PrintCommand,
    },
    /// Build every configuration runnable on this host.
    Build {
        /// Build type letter (defaults to `project.buildtype`).
        #[arg(long = "type")]
        build_type: Option<String>,
        /// Revision to check out (defaults to the head).
        #[arg(long)]
        revision: Option<String>,
        #[arg(long, default_value = "build")]
        base_dir: PathBuf,
    },
    /// Run the CI agent.
    Ci {
        #[arg(value_enum)]
        mode: CiMode,
        #[arg(long, default_value = ".autobuild")]
        state_dir: PathBuf,
        /// Initial checkpoint for a fresh state directory.
        #[arg(long)]
        since: Option<String>,
        /// Stop the slave loop after this many iterations.
        #[arg(long)]
        max_iterations: Option<u64>,
        /// Build file to watch; may be repeated. Defaults to `--file`.
        #[arg(long = "script")]
        scripts: Vec<PathBuf>,
        /// Also watch every `*.toml` build file in this directory.
        #[arg(long)]
        control_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PrintCommand {
    CurrentRevision,
    RevisionsSince {
        revision: String,
        count: Option<usize>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum CiMode {
    /// Query once, build, and exit.
    FindOnce,
    /// Poll and build until stopped.
    Slave,
    /// Build the current revision of every build file as a snapshot.
    TestBuild,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Query { key } => {
            let project = load_project(&cli.file, cli.verbose)?;
            println!("{}", query_setting(project.settings(), &key)?);
            Ok(exit_codes::OK)
        }
        Command::Print { state_dir, what } => {
            let project = load_project(&cli.file, cli.verbose)?;
            cmd_print(&project, &state_dir, what)
        }
        Command::Build {
            build_type,
            revision,
            base_dir,
        } => {
            let project = load_project(&cli.file, cli.verbose)?;
            cmd_build(&project, build_type.as_deref(), revision, base_dir)
        }
        Command::Ci {
            mode,
            state_dir,
            since,
            max_iterations,
            mut scripts,
            control_dir,
        } => {
            logging::init(cli.verbose);
            if let Some(dir) = &control_dir {
                info!(dir = %dir.display(), "using control directory");
                scripts.extend(control_dir_files(dir)?);
            }
            if scripts.is_empty() {
                scripts.push(cli.file);
            }
            let scripts = scripts
                .iter()
                .map(|path| {
                    std::path::absolute(path)
                        .with_context(|| format!("absolute path of {}", path.display()))
                })
                .collect::<Result<Vec<_>>>()?;
            cmd_ci(&scripts, mode, &state_dir, since.as_deref(), max_iterations)
        }
    }
}

fn load_project(file: &Path, verbose: u8) -> Result<Project> {
    let project = load_build_file(file)?;
    let script_level: u8 = project.settings().get_parsed(SettingKey::ScriptLogLevel)?;
    logging::init(verbose.max(script_level));
    info!(project = project.name(), file = %file.display(), "build file loaded");
    Ok(project)
}

fn engine_options(project: &Project, cache_dir: &Path) -> EngineOptions {
    let mut options = EngineOptions::new(cache_dir);
    options.branch = project.branch().map(str::to_string);
    options.build_types = project.build_types().clone();
    options
}

fn cmd_print(project: &Project, state_dir: &Path, what: PrintCommand) -> Result<i32> {
    let paths = StatePaths::new(state_dir).for_project(project.name());
    paths.ensure()?;
    let engine = engine_for(project.scm(), engine_options(project, &paths.cache_dir));
    match what {
        PrintCommand::CurrentRevision => {
            println!("{}", format_revision(&engine.current_revision()?));
        }
        PrintCommand::RevisionsSince { revision, count } => {
            for info in engine.revisions_since(&revision, count)? {
                println!("{}", format_revision(&info));
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_build(
    project: &Project,
    build_type: Option<&str>,
    revision: Option<String>,
    base_dir: PathBuf,
) -> Result<i32> {
    let build_type: BuildType = match build_type {
        Some(code) => code.parse()?,
        None => project.settings().build_type()?,
    };
    let tools = project.required_tools();
    let host = detect_toolchains(tools.iter().map(String::as_str), &[]);
    let request = BuildRequest {
        build_type,
        revision,
        base_dir: std::path::absolute(&base_dir)
            .with_context(|| format!("absolute path of {}", base_dir.display()))?,
    };
    let report = build_project(project, &host, &request, &CancelToken::new())?;
    print_report(project, &report);
    exit_code_for(project, &report)
}

fn print_report(project: &Project, report: &ProjectReport) {
    for skipped in &report.skipped {
        println!("{}: skipped ({:?})", skipped.configuration, skipped.mismatches);
    }
    let Some(build) = &report.build else {
        return;
    };
    let outcome = match &build.pipeline.outcome {
        PipelineOutcome::Success => "passed".to_string(),
        PipelineOutcome::Cancelled => "cancelled".to_string(),
        PipelineOutcome::Failed(failure) => format!(
            "failed in {} ({} {}: {:?})",
            failure.step, failure.scope, failure.action, failure.result
        ),
    };
    println!("{}: {outcome}", project.name());
    for (action, score) in &build.pipeline.scores {
        println!("{}: score {action}: {score:?}", project.name());
    }
}

fn exit_code_for(project: &Project, report: &ProjectReport) -> Result<i32> {
    if report.build.is_none() {
        return Err(Error::configuration(format!(
            "no configuration of project '{}' is runnable on this host",
            project.name()
        ))
        .into());
    }
    if report.succeeded() {
        return Ok(exit_codes::OK);
    }
    Ok(match report.first_failure() {
        Some(failure) if matches!(failure.result, ActionResult::TimedOut { .. }) => {
            exit_codes::TIMEOUT
        }
        Some(_) => exit_codes::BUILD_FAILED,
        None => exit_codes::ERROR,
    })
}

/// Everything one watched build file needs for the lifetime of the agent.
struct Watched {
    project: Project,
    engine: Box<dyn RevisionEngine>,
    launcher: SubprocessLauncher,
    paths: StatePaths,
    config: CiConfig,
}

impl Watched {
    fn new(
        file: CheckedBuildFile,
        agent: &StatePaths,
        config: &CiConfig,
        exe: &Path,
    ) -> Result<Self> {
        let project = file.project;
        let paths = agent.for_project(project.name());
        paths.ensure()?;
        let mut config = config.clone();
        let settings = project.settings();
        config.build_cap = config
            .build_cap
            .min(settings.get_parsed(SettingKey::CiBuildCap)?);
        if settings.get_bool(SettingKey::ScriptIgnoreCommitMessageCommands)? {
            config.honor_ignore_marker = false;
        }
        let mut options = engine_options(&project, &paths.cache_dir);
        options.retry = config.retry.policy();
        let engine = engine_for(project.scm(), options);
        let launcher = SubprocessLauncher::new(
            exe.to_string_lossy().into_owned(),
            vec!["--file".to_string(), file.path.to_string_lossy().into_owned()],
        );
        Ok(Self {
            project,
            engine,
            launcher,
            paths,
            config,
        })
    }

    fn scheduler(&self, stop: &CancelToken) -> Scheduler<'_> {
        Scheduler::new(
            self.engine.as_ref(),
            &self.launcher,
            self.paths.clone(),
            self.config.clone(),
            stop.clone(),
        )
    }
}

fn cmd_ci(
    scripts: &[PathBuf],
    mode: CiMode,
    state_dir: &Path,
    since: Option<&str>,
    max_iterations: Option<u64>,
) -> Result<i32> {
    let agent = StatePaths::new(state_dir);
    agent.ensure()?;
    let config = load_config(&agent.config_path)?;
    let checked = check_build_files(scripts);
    if checked.is_empty() {
        return Err(Error::configuration("no usable build file to watch").into());
    }
    let exe = std::env::current_exe().context("locate the autobuild executable")?;
    let watched = checked
        .into_iter()
        .map(|file| Watched::new(file, &agent, &config, &exe))
        .collect::<Result<Vec<_>>>()?;
    let stop = CancelToken::new();
    let schedulers: Vec<Scheduler<'_>> = watched.iter().map(|w| w.scheduler(&stop)).collect();

    match mode {
        CiMode::FindOnce => {
            let mut first_error = None;
            for (watched, scheduler) in watched.iter().zip(&schedulers) {
                match scheduler.find_once(since) {
                    Ok(outcome) => {
                        for record in &outcome.records {
                            print_record(watched.project.name(), record);
                        }
                    }
                    Err(err) => {
                        error!(
                            project = watched.project.name(),
                            err = %format!("{err:#}"),
                            "find-once failed, continuing with the next build file"
                        );
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        CiMode::Slave => {
            let summary = run_slaves(&schedulers, since, max_iterations, |idx, outcome| {
                for record in &outcome.records {
                    print_record(watched[idx].project.name(), record);
                }
            })?;
            info!(
                iterations = summary.iterations,
                builds = summary.builds,
                stop = ?summary.stop,
                "ci agent stopped"
            );
        }
        CiMode::TestBuild => {
            let mut failed = false;
            for (watched, scheduler) in watched.iter().zip(&schedulers) {
                let meta = scheduler.test_build()?;
                println!(
                    "{} {} {} {}",
                    watched.project.name(),
                    meta.revision,
                    meta.build_type,
                    meta.status
                );
                failed |= meta.status != BuildStatus::Passed;
            }
            if failed {
                return Ok(exit_codes::BUILD_FAILED);
            }
        }
    }
    Ok(exit_codes::OK)
}

fn print_record(project: &str, record: &StatusRecord) {
    println!(
        "{project} {} {} {}",
        record.revision, record.build_type, record.status
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query() {
        let cli = Cli::parse_from(["autobuild", "query", "project.name"]);
        assert_eq!(cli.file, PathBuf::from("autobuild.toml"));
        assert!(matches!(cli.command, Command::Query { key } if key == "project.name"));
    }

    #[test]
    fn parse_build_with_type_and_verbosity() {
        let cli = Cli::parse_from([
            "autobuild",
            "-vv",
            "--file",
            "proj.toml",
            "build",
            "--type",
            "m",
            "--revision",
            "abc",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.file, PathBuf::from("proj.toml"));
        match cli.command {
            Command::Build {
                build_type,
                revision,
                base_dir,
            } => {
                assert_eq!(build_type.as_deref(), Some("m"));
                assert_eq!(revision.as_deref(), Some("abc"));
                assert_eq!(base_dir, PathBuf::from("build"));
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn parse_ci_slave() {
        let cli = Cli::parse_from([
            "autobuild",
            "ci",
            "slave",
            "--state-dir",
            "/var/lib/autobuild",
            "--max-iterations",
            "3",
        ]);
        match cli.command {
            Command::Ci {
                mode,
                state_dir,
                since,
                max_iterations,
                scripts,
                control_dir,
            } => {
                assert_eq!(mode, CiMode::Slave);
                assert_eq!(state_dir, PathBuf::from("/var/lib/autobuild"));
                assert_eq!(since, None);
                assert_eq!(max_iterations, Some(3));
                assert!(scripts.is_empty());
                assert_eq!(control_dir, None);
            }
            _ => panic!("expected ci"),
        }
    }

    #[test]
    fn parse_ci_test_build_with_scripts() {
        let cli = Cli::parse_from([
            "autobuild",
            "ci",
            "test-build",
            "--script",
            "hello.toml",
            "--script",
            "world.toml",
            "--control-dir",
            "scripts",
        ]);
        match cli.command {
            Command::Ci {
                mode,
                scripts,
                control_dir,
                ..
            } => {
                assert_eq!(mode, CiMode::TestBuild);
                assert_eq!(
                    scripts,
                    vec![PathBuf::from("hello.toml"), PathBuf::from("world.toml")]
                );
                assert_eq!(control_dir, Some(PathBuf::from("scripts")));
            }
            _ => panic!("expected ci"),
        }
    }

    #[test]
    fn parse_print_revisions_since() {
        let cli = Cli::parse_from(["autobuild", "print", "revisions-since", "abc", "2"]);
        assert!(matches!(
            cli.command,
            Command::Print {
                what: PrintCommand::RevisionsSince { ref revision, count: Some(2) },
                ..
            } if revision == "abc"
        ));
    }
}
