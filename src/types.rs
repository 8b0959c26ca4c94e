use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Canonical model identifier used throughout the crate.
pub type ModelId = String;

/// What kind of transformation a model is.
///
/// The kind only decides which runner executes the model; the coordinator
/// treats both kinds identically otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Query-based model (SQL and friends).
    #[default]
    Declarative,
    /// Script-based model (Python, notebooks, ML jobs).
    Procedural,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Declarative => f.write_str("declarative"),
            ModelKind::Procedural => f.write_str("procedural"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "declarative" | "sql" => Ok(ModelKind::Declarative),
            "procedural" | "python" => Ok(ModelKind::Procedural),
            other => Err(format!(
                "invalid model kind: {other} (expected \"declarative\" or \"procedural\")"
            )),
        }
    }
}

/// How a model failure propagates to its dependents.
///
/// - `FailFast`: every transitive dependent that has not been submitted yet
///   is marked skipped and never runs (default behaviour).
/// - `Degrade`: dependents are still submitted; dependency validation then
///   rejects them with an explicit "not ready" error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    FailFast,
    Degrade,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => f.write_str("fail-fast"),
            FailurePolicy::Degrade => f.write_str("degrade"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "fail-fast" | "failfast" => Ok(FailurePolicy::FailFast),
            "degrade" => Ok(FailurePolicy::Degrade),
            other => Err(format!(
                "invalid failure_policy: {other} (expected \"fail-fast\" or \"degrade\")"
            )),
        }
    }
}
