//! I/O helpers for the build engine and the CI agent.

pub mod build_file;
pub mod build_log;
pub mod build_status;
pub mod config;
pub mod git;
pub mod init;
pub mod process;
pub mod scm;
pub mod svn;
pub mod toolchain;
