//! Error taxonomy shared by every layer.
//!
//! Functions return `anyhow::Result`; the variants below are attached to the
//! error chain so callers can tell a misconfigured host from a hung tool or a
//! rejected build without string matching.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Setup problem: missing tool, unknown key or step, malformed descriptor, version mismatch.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A command exceeded its deadline and was killed.
    #[error("command timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    /// A step or source-control query failed during execution.
    #[error("build error: {0}")]
    Build(String),

    /// Talking to the source-control backend failed; retryable.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Find the outermost taxonomy error attached to `err`.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.downcast_ref::<Error>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<Error>()))
}

pub fn is_configuration(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(Error::Configuration(_)))
}

pub fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(Error::Timeout { .. }))
}

pub fn is_transport(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(Error::Transport(_)))
}
