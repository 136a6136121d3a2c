//! External command execution: tool resolution, version checks, timeouts and
//! bounded output capture.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::Error;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;
/// How long output readers may keep running after a timed-out child was killed.
pub const KILL_GRACE: Duration = Duration::from_secs(2);
pub const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured child process output.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Result code as seen by actions: the exit code, or -1 for signal deaths.
    pub fn result_code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }

    pub fn truncated_notice(&self, label: &str) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        notice
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

type StreamResult = (Stream, Result<(Vec<u8>, usize)>);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// After a timeout the child is killed and the readers get [`KILL_GRACE`] to finish, so the call
/// returns within `timeout + KILL_GRACE` even if grandchildren keep the pipes open.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel::<StreamResult>();
    let stdout_tx = tx.clone();
    thread::spawn(move || {
        let _ = stdout_tx.send((Stream::Stdout, read_stream_limited(stdout, output_limit_bytes)));
    });
    thread::spawn(move || {
        let _ = tx.send((Stream::Stderr, read_stream_limited(stderr, output_limit_bytes)));
    });

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let grace = timed_out.then_some(KILL_GRACE);
    let mut output = CommandOutput {
        exit_code: status.code(),
        timed_out,
        ..CommandOutput::default()
    };
    collect_streams(&rx, grace, &mut output)?;
    output.duration = started.elapsed();

    if output.stdout_truncated > 0 || output.stderr_truncated > 0 {
        warn!(
            stdout_truncated = output.stdout_truncated,
            stderr_truncated = output.stderr_truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?output.exit_code, timed_out, "command finished");
    Ok(output)
}

fn collect_streams(
    rx: &mpsc::Receiver<StreamResult>,
    grace: Option<Duration>,
    output: &mut CommandOutput,
) -> Result<()> {
    let deadline = grace.map(|grace| Instant::now() + grace);
    for _ in 0..2 {
        let received = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(received) => received,
                    Err(_) => {
                        warn!("output readers still busy after kill grace, abandoning them");
                        return Ok(());
                    }
                }
            }
            None => rx
                .recv()
                .map_err(|_| anyhow!("output reader thread panicked"))?,
        };
        let (stream, result) = received;
        let (bytes, truncated) = result.with_context(|| format!("read {stream:?}"))?;
        match stream {
            Stream::Stdout => {
                output.stdout = bytes;
                output.stdout_truncated = truncated;
            }
            Stream::Stderr => {
                output.stderr = bytes;
                output.stderr_truncated = truncated;
            }
        }
    }
    Ok(())
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// An external tool invocation: what to run, where to look for it and how.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    search_paths: Vec<PathBuf>,
    workdir: Option<PathBuf>,
    env: Vec<(String, String)>,
    version_args: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            search_paths: Vec::new(),
            workdir: None,
            env: Vec::new(),
            version_args: vec!["--version".to_string()],
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    /// Build from an argv vector (`argv[0]` is the program).
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::configuration("empty command line"))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Directories searched, in order, before `PATH`.
    pub fn search_paths<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_paths.extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Arguments used by [`CommandRunner::check_version`] (default `--version`).
    pub fn version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Absolute path of the executable: explicit paths are checked as given,
    /// bare names are looked up in the search paths, then in `PATH`.
    pub fn resolve(&self) -> Result<PathBuf> {
        let candidate = Path::new(&self.program);
        if candidate.components().count() > 1 {
            let candidate = match (&self.workdir, candidate.is_relative()) {
                (Some(dir), true) => dir.join(candidate),
                _ => candidate.to_path_buf(),
            };
            if is_executable(&candidate) {
                return absolute(&candidate);
            }
            return Err(Error::configuration(format!(
                "required tool '{}' is not an executable file",
                candidate.display()
            ))
            .into());
        }

        let path_dirs: Vec<PathBuf> = env::var_os("PATH")
            .map(|paths: OsString| env::split_paths(&paths).collect())
            .unwrap_or_default();
        for dir in self.search_paths.iter().chain(path_dirs.iter()) {
            let candidate = dir.join(&self.program);
            if is_executable(&candidate) {
                debug!(tool = %self.program, path = %candidate.display(), "resolved tool");
                return absolute(&candidate);
            }
        }
        Err(Error::configuration(format!(
            "required tool '{}' not found (searched {} extra directories and PATH)",
            self.program,
            self.search_paths.len()
        ))
        .into())
    }

    /// Run the tool with its version arguments and require `expected_code`.
    ///
    /// Returns stdout and stderr combined so callers can check product names.
    #[instrument(skip_all, fields(tool = %self.program, expected_code))]
    pub fn check_version(&self, expected_code: i32) -> Result<String> {
        let resolved = self.resolve()?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&self.version_args);
        self.apply_environment(&mut cmd);
        let output = run_command_with_timeout(cmd, VERSION_CHECK_TIMEOUT, self.output_limit_bytes)
            .with_context(|| format!("run {} {}", self.program, self.version_args.join(" ")))?;
        if output.timed_out {
            return Err(Error::Timeout {
                command: format!("{} {}", self.program, self.version_args.join(" ")),
                timeout_secs: VERSION_CHECK_TIMEOUT.as_secs(),
            }
            .into());
        }
        if output.exit_code != Some(expected_code) {
            warn!(exit_code = ?output.exit_code, "version check failed");
            return Err(Error::configuration(format!(
                "version check of '{}' exited with {:?}, expected {expected_code}",
                self.program, output.exit_code
            ))
            .into());
        }
        Ok(output.combined_text())
    }

    /// Run to completion or until `timeout`.
    ///
    /// A non-zero exit is returned as data; only a timeout (or failing to
    /// start the process at all) is an error.
    #[instrument(skip_all, fields(command = %self.command_line(), timeout_secs = timeout.as_secs()))]
    pub fn run(&self, timeout: Duration) -> Result<CommandOutput> {
        let resolved = self.resolve()?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&self.args);
        self.apply_environment(&mut cmd);
        info!("running command");
        let output = run_command_with_timeout(cmd, timeout, self.output_limit_bytes)
            .with_context(|| format!("run {}", self.command_line()))?;
        if output.timed_out {
            error!(
                elapsed_ms = output.duration.as_millis() as u64,
                "command hung and was killed"
            );
            return Err(Error::Timeout {
                command: self.command_line(),
                timeout_secs: timeout.as_secs(),
            }
            .into());
        }
        info!(exit_code = ?output.exit_code, "command finished");
        Ok(output)
    }

    fn apply_environment(&self, cmd: &mut Command) {
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("absolute path of {}", path.display()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}
