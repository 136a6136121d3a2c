//! Revision engine abstraction and the transport retry policy.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

use crate::core::build_type::BuildTypeTable;
use crate::core::descriptor::{ScmDescriptor, ScmKind};
use crate::core::revision::RevisionInfo;
use crate::error::{Error, is_transport};
use crate::io::git::GitEngine;
use crate::io::svn::SvnEngine;

/// Read-only view of a project's revision history.
pub trait RevisionEngine {
    fn kind(&self) -> ScmKind;

    /// The newest revision on the tracked line of development.
    fn current_revision(&self) -> Result<RevisionInfo>;

    /// Revisions strictly after `revision`, oldest first, at most `count` of them.
    ///
    /// Fails with a build error if `revision` is unknown to the repository.
    fn revisions_since(&self, revision: &str, count: Option<usize>) -> Result<Vec<RevisionInfo>>;
}

/// Bounded retry with exponential backoff for transport failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            factor: 1,
        }
    }

    /// Run `op`, retrying while it fails with a transport error.
    ///
    /// Other errors are returned immediately. Exhausting the attempts turns the
    /// last transport error into a build error.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_transport(&err) && attempt < attempts => {
                    warn!(
                        what,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        err = %err,
                        "transport failure, retrying"
                    );
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(self.factor.max(1));
                    attempt += 1;
                }
                Err(err) if is_transport(&err) => {
                    error!(what, attempts, err = %err, "transport failure, giving up");
                    return Err(Error::build(format!(
                        "{what} failed after {attempts} attempts: {err:#}"
                    ))
                    .into());
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Everything an engine needs beyond the descriptor.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Where engines keep local mirrors.
    pub cache_dir: PathBuf,
    pub branch: Option<String>,
    pub build_types: BuildTypeTable,
    pub retry: RetryPolicy,
}

impl EngineOptions {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            branch: None,
            build_types: BuildTypeTable::standard(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Select the engine matching the descriptor's scheme.
pub fn engine_for(descriptor: &ScmDescriptor, options: EngineOptions) -> Box<dyn RevisionEngine> {
    match descriptor.kind {
        ScmKind::Git => Box::new(GitEngine::new(&descriptor.location, options)),
        ScmKind::Svn => Box::new(SvnEngine::new(&descriptor.location, options)),
    }
}

/// Parse a descriptor string and open its engine.
pub fn open_engine(descriptor: &str, options: EngineOptions) -> Result<Box<dyn RevisionEngine>> {
    let descriptor = ScmDescriptor::parse(descriptor)?;
    Ok(engine_for(&descriptor, options))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::{classify, is_configuration};

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::ZERO,
            factor: 2,
        }
    }

    #[test]
    fn transport_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let value = fast_retry(3)
            .run("fetch", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(Error::transport("connection reset").into())
                } else {
                    Ok(42)
                }
            })
            .expect("third attempt succeeds");
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhausted_retries_become_build_error() {
        let calls = Cell::new(0);
        let err = fast_retry(2)
            .run("fetch", || -> Result<()> {
                calls.set(calls.get() + 1);
                Err(Error::transport("host unreachable").into())
            })
            .expect_err("exhausted");
        assert_eq!(calls.get(), 2);
        assert!(matches!(classify(&err), Some(Error::Build(_))));
    }

    #[test]
    fn other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = fast_retry(5)
            .run("log", || -> Result<()> {
                calls.set(calls.get() + 1);
                Err(Error::build("unknown revision deadbeef").into())
            })
            .expect_err("not retried");
        assert_eq!(calls.get(), 1);
        assert!(matches!(classify(&err), Some(Error::Build(_))));
    }

    #[test]
    fn descriptor_selects_matching_engine() {
        let temp = tempfile::tempdir().expect("tempdir");
        for (descriptor, kind) in [
            ("git:/srv/hello", ScmKind::Git),
            ("git://example.org/hello.git", ScmKind::Git),
            ("svn:https://svn.example.org/hello/trunk", ScmKind::Svn),
            ("svn://example.org/hello", ScmKind::Svn),
        ] {
            let engine = open_engine(descriptor, EngineOptions::new(temp.path())).expect(descriptor);
            assert_eq!(engine.kind(), kind, "{descriptor}");
        }
        let err = open_engine("cvs:/srv/hello", EngineOptions::new(temp.path()))
            .err()
            .expect("unknown scheme");
        assert!(is_configuration(&err));
    }
}
