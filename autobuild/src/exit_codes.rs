//! Stable exit codes for autobuild CLI commands.

use crate::error::{Error, classify};

/// Command completed normally (for `build`: every configuration passed).
pub const OK: i32 = 0;
/// Unclassified failure (I/O, corrupt state files, etc.).
pub const ERROR: i32 = 1;
/// `autobuild build` ran and at least one configuration failed.
pub const BUILD_FAILED: i32 = 2;
/// Missing tool, unknown setting/step, malformed descriptor or build file.
pub const CONFIGURATION: i32 = 3;
/// An external command was killed after its deadline.
pub const TIMEOUT: i32 = 4;

/// Map an error to the exit code reported by the binary.
pub fn for_error(err: &anyhow::Error) -> i32 {
    match classify(err) {
        Some(Error::Configuration(_)) => CONFIGURATION,
        Some(Error::Timeout { .. }) => TIMEOUT,
        Some(Error::Build(_)) | Some(Error::Transport(_)) => BUILD_FAILED,
        None => ERROR,
    }
}
