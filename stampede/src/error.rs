use thiserror::Error;

use crate::metric::MetricKind;

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can stop a load test or reject its configuration.
///
/// Per-request failures never show up here: they are absorbed into metrics
/// so the health of a run is observable as a rate instead of a crash.
#[derive(Debug, Error)]
pub enum Error {
    /// The run configuration failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// The target did not answer the startup probe
    #[error("Target {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    /// The HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A sample conflicts with the series it belongs to
    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    /// The remote-write payload could not be produced or delivered
    #[error("Export error: {0}")]
    Export(String),

    /// A runtime task panicked or was aborted
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an unreachable-target error
    pub fn unreachable(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::Unreachable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an export error
    pub fn export(msg: impl Into<String>) -> Self {
        Error::Export(msg.into())
    }
}

/// Rejected samples. Returned instead of dropping the value silently.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("series {name} is a {existing} and cannot accept a {attempted} sample")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        attempted: MetricKind,
    },

    #[error("counter {name} cannot decrease (got {value})")]
    NegativeIncrement { name: String, value: f64 },

    #[error("sample for {name} is not a finite number")]
    NonFinite { name: String },
}
