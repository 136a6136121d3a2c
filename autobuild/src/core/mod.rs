//! Deterministic, pure logic shared by the build engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod build_type;
pub mod descriptor;
pub mod environment;
pub mod revision;
pub mod score;
pub mod settings;
pub mod steps;
