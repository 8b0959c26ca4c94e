// src/exec/mod.rs

//! Model execution layer.
//!
//! - [`runner`] defines the `Runner` trait the pipeline talks to, plus the
//!   per-kind `RunnerRegistry`.
//! - [`command`] provides `CommandRunner`, which runs a model's shell
//!   command with `tokio::process` and parses its row count from stdout.

pub mod command;
pub mod runner;

pub use command::CommandRunner;
pub use runner::{RunContext, Runner, RunnerRegistry};
