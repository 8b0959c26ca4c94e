// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::types::FailurePolicy;

/// Command-line arguments for `modeldag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "modeldag",
    version,
    about = "Run data models in dependency order within a fixed resource pool.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Modeldag.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Modeldag.toml")]
    pub config: String,

    /// Run only these models plus everything downstream of them.
    ///
    /// Upstream models outside the selection are not executed; their last
    /// recorded run decides whether the selection is ready.
    #[arg(long = "select", value_name = "MODEL")]
    pub select: Vec<String>,

    /// Override `[config].failure_policy` (fail-fast or degrade).
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<FailurePolicy>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MODELDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print levels and the execution plan, but don't
    /// execute any model.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_is_repeatable_and_policy_parses() {
        let args = CliArgs::try_parse_from([
            "modeldag",
            "--select",
            "stg_orders",
            "--select",
            "stg_users",
            "--policy",
            "degrade",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(args.config, "Modeldag.toml");
        assert_eq!(args.select, vec!["stg_orders", "stg_users"]);
        assert_eq!(args.policy, Some(FailurePolicy::Degrade));
        assert!(args.dry_run);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(CliArgs::try_parse_from(["modeldag", "--policy", "yolo"]).is_err());
    }
}
