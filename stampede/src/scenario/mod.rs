//! Scenario: the unit of work a VU repeats.
//!
//! A [`Scenario`] is an injected strategy: the runtime hands it an
//! [`IterationContext`] and awaits its completion. Samples are recorded through
//! the context's [`Recorder`] as calls complete, so each VU's samples reach the
//! aggregator in completion order.
//!
//! The built-in [`HttpScenario`] covers data-driven HTTP request chains;
//! anything else can implement the trait directly.
pub mod http;
pub mod runner;
pub mod template;

pub use http::{Extract, FollowUp, HttpMethod, HttpScenario, RequestTemplate, ScenarioSpec, StatusPredicate, Step};
pub use runner::ScenarioRunner;

use async_trait::async_trait;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
    aggregate::Aggregator,
    error::Result,
    metric::{Sample, Tags},
};

/// Errors that abort a single iteration. They never stop the VU.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScenarioError {
    #[error("template error: {0}")]
    Template(String),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{0}")]
    Custom(String),
}

impl ScenarioError {
    pub fn template(msg: impl Into<String>) -> Self {
        ScenarioError::Template(msg.into())
    }

    pub fn custom(msg: impl Into<String>) -> Self {
        ScenarioError::Custom(msg.into())
    }
}

/// Handle used by scenarios to report samples.
///
/// Stamps every sample with the run's base tags (`host`, `test_type`) before
/// handing it to the aggregator. A rejected sample is logged, never ignored.
#[derive(Debug, Clone)]
pub struct Recorder {
    aggregator: Arc<Aggregator>,
    base_tags: Arc<Tags>,
}

impl Recorder {
    pub fn new(aggregator: Arc<Aggregator>, base_tags: Tags) -> Self {
        Self {
            aggregator,
            base_tags: Arc::new(base_tags),
        }
    }

    pub fn record(&self, sample: Sample) {
        let sample = sample.with_base_tags(&self.base_tags);
        if let Err(e) = self.aggregator.record(sample) {
            tracing::warn!("Sample rejected: {e}");
        }
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn base_tags(&self) -> &Tags {
        &self.base_tags
    }
}

/// What a scenario gets for one iteration.
#[derive(Debug, Clone)]
pub struct IterationContext {
    /// 1-based VU identity, stable for the VU's lifetime.
    pub vu_id: u64,
    /// 0-based iteration index within this VU.
    pub iteration: u64,
    pub recorder: Recorder,
}

/// How a single call ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// The target answered with a status the step does not accept.
    UnexpectedStatus { status: u16 },
    /// No HTTP response: refused, reset, timed out.
    Transport { reason: String },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub step: String,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub duration: Duration,
    pub outcome: CallOutcome,
}

/// Everything that happened during one iteration, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IterationOutcome {
    pub calls: Vec<CallRecord>,
    /// Dependent calls that were not issued, with the reason.
    pub skipped: Vec<String>,
    /// Responses whose body did not have the shape a dependent call needed.
    pub unexpected_shapes: u64,
}

impl IterationOutcome {
    pub fn failed_calls(&self) -> usize {
        self.calls.iter().filter(|c| !c.outcome.is_success()).count()
    }
}

/// The unit of work executed by every VU iteration.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use stampede::{
///     metric::Sample,
///     scenario::{IterationContext, IterationOutcome, Scenario, ScenarioError},
/// };
///
/// struct Noop;
///
/// #[async_trait]
/// impl Scenario for Noop {
///     fn name(&self) -> &str {
///         "noop"
///     }
///
///     async fn run(&self, ctx: &IterationContext) -> Result<IterationOutcome, ScenarioError> {
///         ctx.recorder.record(Sample::counter("noop", 1.0));
///         Ok(IterationOutcome::default())
///     }
/// }
/// ```
#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one iteration to completion.
    async fn run(&self, ctx: &IterationContext) -> std::result::Result<IterationOutcome, ScenarioError>;

    /// Startup validation, called once before any VU starts. An error aborts the run.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}
