//! Stampede: a stage-driven virtual-user load generator for HTTP services.
//!
//! Stampede drives a target service with a time-varying number of concurrent
//! virtual users (VUs). Each VU repeats a scenario as fast as it completes, with
//! an optional think time, while every request feeds a shared metrics
//! aggregator that can be pushed to Prometheus and summarized at the end.
//!
//! # Architecture
//!
//! The main building blocks, leaf first:
//!
//! - [`Aggregator`]: thread-safe accumulation of [`metric::Sample`]s into
//!   Trend/Rate/Counter series keyed by name and tag set.
//! - [`export::RemoteWriteExporter`]: flushes aggregator snapshots to a
//!   Prometheus remote-write endpoint on its own interval.
//! - [`Scenario`]: the unit of work a VU repeats. [`scenario::HttpScenario`]
//!   runs a data-driven chain of HTTP requests; anything else implements the trait.
//! - [`executor::StageSchedule`]: turns `{duration, target}` stages into a live,
//!   deterministic concurrency target.
//! - [`Executor`]: runs the scenario. [`RampingVuExecutor`] keeps its VU pool
//!   equal to the schedule's target.
//! - [`report::SummaryReport`] and [`Reporter`]: render the final snapshot.
//! - [`LoadTest`]: glue that ties a [`RunConfig`], a scenario and all of the
//!   above into a single run.
//!
//! # Example
//!
//! Search then fetch every hit, ramping up to 100 VUs:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use stampede::{
//!     LoadTest, Reporter, RunConfig,
//!     config::{LoadProfile, ThinkTime},
//!     executor::Stage,
//!     report::StdoutReporter,
//!     scenario::{Extract, FollowUp, RequestTemplate, ScenarioSpec, StatusPredicate, Step},
//! };
//!
//! #[tokio::main]
//! async fn main() -> stampede::Result<()> {
//!     let config = RunConfig::builder()
//!         .host("localhost:6000")
//!         .load(LoadProfile::stages(vec![
//!             Stage::new(Duration::from_secs(30), 10),
//!             Stage::new(Duration::from_secs(60), 100),
//!             Stage::new(Duration::from_secs(30), 0),
//!         ]))
//!         .think_time(ThinkTime::Fixed(Duration::from_millis(100)))
//!         .build()
//!         // TEST_HOST, TEST_TYPE and K6_PROMETHEUS_RW_SERVER_URL win over the code
//!         .apply_env()?;
//!
//!     let spec = ScenarioSpec {
//!         name: "search_and_get".into(),
//!         parameters: vec![[("q".to_string(), "Ив".to_string())].into()],
//!         steps: vec![Step {
//!             follow: vec![FollowUp {
//!                 name: "get".into(),
//!                 extract: Extract::EachItem { field: "id".into() },
//!                 request: RequestTemplate::get("/user/get/{id}"),
//!                 expect: StatusPredicate::Exact(200),
//!                 metric_prefix: None,
//!             }],
//!             ..Step::new(
//!                 "search",
//!                 RequestTemplate::get("/user/search").with_query("first_name", "{q}"),
//!             )
//!         }],
//!     };
//!
//!     let outcome = LoadTest::http(config, spec)?.run().await?;
//!     StdoutReporter.report(&outcome.report()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `internals`: exposes the executor's pool and phase-offset helpers for
//!   benchmarks and custom executors.
//!
//! # Where to start
//!
//! - Read the docs for [`Scenario`], [`Executor`] and [`RunConfig`].
//! - See `examples/` for the search, search-and-get and register runs.

/// Metric series and the concurrent aggregator
pub mod aggregate;
/// Run configuration, environment overrides and validation
pub mod config;
/// Run-level error type
pub mod error;
/// Orchestrators that define how things will actually run
pub mod executor;
/// Prometheus remote write
pub mod export;
/// Glue that wires a whole run together
pub mod load_test;
/// Single samples and series identity
pub mod metric;
/// Reports and Reporters
pub mod report;
/// The work each VU repeats
pub mod scenario;
/// Point-in-time snapshots of the aggregator
pub mod summary;
/// Pass/fail gates over the final snapshot
pub mod threshold;

pub use aggregate::{Aggregate, Aggregator};
pub use config::RunConfig;
pub use error::{Error, Result};
pub use executor::{Executor, RampingVuExecutor, StopHandle};
pub use load_test::{LoadTest, RunOutcome};
pub use metric::{MetricKind, Sample};
pub use report::{Reporter, SummaryReport};
pub use scenario::Scenario;
pub use summary::RunSummary;
