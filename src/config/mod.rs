// src/config/mod.rs

//! Configuration loading and validation for modeldag.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate ids, durations, the pool and DAG correctness (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{ConfigFile, ConfigSection, ModelConfig, RawConfigFile, parse_duration};
pub use validate::validate_raw_config;
