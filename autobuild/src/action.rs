//! Actions: the atomic units of work inside a step.

use std::time::Duration;

use anyhow::Result;

use crate::core::score::{ScoreFormat, ScoreParse, parse_score};
use crate::io::process::{CommandOutput, CommandRunner};

/// A unit of work. `run` returns a result code where 0 means success;
/// an `Err` means the action could not produce a result at all (tool
/// missing, timeout).
pub trait Action {
    fn describe(&self) -> String;

    fn run(&mut self) -> Result<i32>;

    fn stdout(&self) -> &[u8] {
        &[]
    }

    fn stderr(&self) -> &[u8] {
        &[]
    }

    /// Score reported by tester actions after `run`.
    fn test_score(&self) -> Option<ScoreParse> {
        None
    }
}

/// An action together with how its failure is treated.
pub struct PlannedAction {
    pub action: Box<dyn Action>,
    /// A non-zero result is logged but does not end the step.
    pub non_fatal: bool,
}

impl PlannedAction {
    pub fn fatal(action: impl Action + 'static) -> Self {
        Self {
            action: Box::new(action),
            non_fatal: false,
        }
    }

    pub fn non_fatal(action: impl Action + 'static) -> Self {
        Self {
            action: Box::new(action),
            non_fatal: true,
        }
    }
}

/// Runs an external command through the [`CommandRunner`].
pub struct ShellAction {
    runner: CommandRunner,
    timeout: Duration,
    score_format: Option<ScoreFormat>,
    output: Option<CommandOutput>,
    score: Option<ScoreParse>,
}

impl ShellAction {
    pub fn new(runner: CommandRunner, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            score_format: None,
            output: None,
            score: None,
        }
    }

    /// Parse stdout for a test score after the command finishes.
    pub fn with_score_format(mut self, format: ScoreFormat) -> Self {
        self.score_format = Some(format);
        self
    }
}

impl Action for ShellAction {
    fn describe(&self) -> String {
        self.runner.command_line()
    }

    fn run(&mut self) -> Result<i32> {
        let output = self.runner.run(self.timeout)?;
        let code = output.result_code();
        if let Some(format) = self.score_format {
            self.score = Some(parse_score(format, &output.stdout_text()));
        }
        self.output = Some(output);
        Ok(code)
    }

    fn stdout(&self) -> &[u8] {
        self.output
            .as_ref()
            .map(|output| output.stdout.as_slice())
            .unwrap_or_default()
    }

    fn stderr(&self) -> &[u8] {
        self.output
            .as_ref()
            .map(|output| output.stderr.as_slice())
            .unwrap_or_default()
    }

    fn test_score(&self) -> Option<ScoreParse> {
        self.score
    }
}
