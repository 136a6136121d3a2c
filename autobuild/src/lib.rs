//! Build automation and continuous integration engine.
//!
//! A project (source location, configurations, required toolchains) is built
//! through a fixed pipeline of steps populated by plugins, and can be watched
//! by an unattended CI agent that builds every new revision.
//!
//! - **[`core`]**: Pure, deterministic logic (step table, settings, build-type
//!   classification, environment matching). No I/O.
//! - **[`io`]**: Side-effecting operations (processes, git/svn, build file,
//!   status persistence). Isolated behind traits where tests need fakes.
//!
//! Orchestration modules ([`pipeline`], [`build`], [`scheduler`], [`query`])
//! combine the two to implement the CLI commands.

pub mod action;
pub mod build;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod plugin;
pub mod project;
pub mod query;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
