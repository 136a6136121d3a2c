//! Host toolchain detection for environment matching.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::core::environment::HostToolchains;
use crate::io::process::CommandRunner;

/// Run each tool with its version arguments. Tools that cannot be found or
/// whose version query fails are left out.
pub fn detect_toolchains<'a>(
    tools: impl IntoIterator<Item = &'a str>,
    search_paths: &[PathBuf],
) -> HostToolchains {
    let mut host = HostToolchains::new();
    for tool in tools {
        let runner = CommandRunner::new(tool).search_paths(search_paths.iter().cloned());
        match runner.check_version(0) {
            Ok(text) => {
                let version = text.trim();
                info!(tool, version, "detected toolchain");
                host.insert(tool, version);
            }
            Err(err) => debug!(tool, err = %format!("{err:#}"), "toolchain not available"),
        }
    }
    host
}
