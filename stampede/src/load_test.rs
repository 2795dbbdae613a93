use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::Aggregator,
    config::RunConfig,
    error::Result,
    executor::{ExecutionReport, Executor, RampingVuExecutor, StopHandle},
    export::{ExportStats, RemoteWriteExporter},
    report::SummaryReport,
    scenario::{HttpScenario, Recorder, Scenario, ScenarioRunner, ScenarioSpec},
    summary::RunSummary,
    threshold::{ThresholdResult, evaluate_all},
};

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// Snapshot taken after every VU joined and the exporter flushed.
    pub summary: RunSummary,
    pub execution: ExecutionReport,
    pub thresholds: Vec<ThresholdResult>,
    pub export: Option<ExportStats>,
}

impl RunOutcome {
    /// `true` unless a threshold was crossed.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn report(&self) -> SummaryReport {
        SummaryReport::from(self.summary.clone())
            .with_execution(&self.execution)
            .with_thresholds(&self.thresholds)
    }
}

/// One configured run: config, scenario and a stop handle.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stampede::{
///     LoadTest, RunConfig,
///     config::LoadProfile,
///     scenario::{RequestTemplate, ScenarioSpec, Step},
/// };
///
/// # async fn run() -> stampede::Result<()> {
/// let config = RunConfig::builder()
///     .host("localhost:6000")
///     .load(LoadProfile::fixed(10, Duration::from_secs(30)))
///     .build()
///     .apply_env()?;
/// let spec = ScenarioSpec {
///     name: "health".into(),
///     parameters: vec![],
///     steps: vec![Step::new("health", RequestTemplate::get("/health"))],
/// };
/// let outcome = LoadTest::http(config, spec)?.run().await?;
/// println!("{}", outcome.report());
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct LoadTest {
    pub config: RunConfig,
    pub scenario: Arc<dyn Scenario>,
    #[builder(default)]
    pub stop: StopHandle,
}

impl LoadTest {
    /// A run of the data-driven HTTP scenario against the configured host.
    pub fn http(config: RunConfig, spec: ScenarioSpec) -> Result<Self> {
        let scenario = HttpScenario::new(spec, &config)?;
        Ok(Self::builder()
            .config(config)
            .scenario(Arc::new(scenario))
            .build())
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        self.config.validate()?;
        let thresholds = self.config.parsed_thresholds()?;

        if self.config.probe {
            tracing::info!("Probing {} before starting VUs", self.config.host);
            self.scenario.probe().await?;
        }

        let aggregator = Arc::new(Aggregator::new());
        let recorder = Recorder::new(aggregator.clone(), self.config.base_tags());
        let runner = ScenarioRunner::new(self.scenario.clone(), recorder, self.config.think_time);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let exporter = match &self.config.remote_write {
            Some(rw) => Some(RemoteWriteExporter::new(rw)?.spawn(aggregator.clone(), shutdown_rx)),
            None => None,
        };

        let executor = RampingVuExecutor::from_config(&self.config, self.stop.clone());
        let execution = executor.exec(&runner).await;

        shutdown_tx.send_replace(true);
        let export = match exporter {
            Some(handle) => Some(handle.await?),
            None => None,
        };
        let execution = execution?;

        let summary = aggregator.snapshot();
        let thresholds = evaluate_all(&thresholds, &aggregator);
        for t in thresholds.iter().filter(|t| !t.passed) {
            tracing::warn!("Threshold crossed: {} (observed {:?})", t.threshold, t.observed);
        }

        Ok(RunOutcome {
            summary,
            execution,
            thresholds,
            export,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Error,
        config::LoadProfile,
        executor::Stage,
        metric::{Sample, names},
        scenario::{IterationContext, IterationOutcome, ScenarioError},
    };
    use async_trait::async_trait;
    use std::{collections::BTreeMap, time::Duration};

    struct Tick;

    #[async_trait]
    impl Scenario for Tick {
        fn name(&self) -> &str {
            "tick"
        }

        async fn run(&self, ctx: &IterationContext) -> std::result::Result<IterationOutcome, ScenarioError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.recorder.record(Sample::trend("search_latency", 120.0));
            ctx.recorder.record(Sample::rate("search_success", ctx.vu_id != 1));
            Ok(IterationOutcome::default())
        }
    }

    fn config() -> RunConfig {
        RunConfig::builder()
            .host("app:6000")
            .test_type("no-index")
            .load(LoadProfile::stages(vec![
                Stage::new(Duration::from_secs(1), 4),
                Stage::new(Duration::from_secs(1), 0),
            ]))
            .tick(Duration::from_millis(100))
            .probe(false)
            .thresholds(BTreeMap::from([
                ("search_latency".to_string(), vec!["p(95)<500".to_string()]),
                ("search_success".to_string(), vec!["rate>0.95".to_string()]),
            ]))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_to_completion_and_evaluates_thresholds() {
        let test = LoadTest::builder().config(config()).scenario(Arc::new(Tick)).build();
        let outcome = test.run().await.unwrap();

        assert!(outcome.execution.iterations > 0);
        assert_eq!(outcome.execution.peak_vus, 4);
        assert!(outcome.export.is_none());
        assert_eq!(
            outcome.summary.counter_total(names::ITERATIONS),
            outcome.execution.iterations as f64
        );

        // every sample carries the run's base tags
        assert!(outcome.summary.series.iter().all(|s| {
            s.key.tags.get("test_type").map(String::as_str) == Some("no-index")
                && s.key.tags.get("host").map(String::as_str) == Some("app:6000")
        }));

        let passed: Vec<bool> = outcome.thresholds.iter().map(|t| t.passed).collect();
        assert_eq!(passed, [true, false]);
        assert!(!outcome.passed());
        assert!(outcome.report().to_string().contains("thresholds"));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_anything_runs() {
        let mut config = config();
        config.load = LoadProfile::stages(vec![]);
        let err = LoadTest::builder()
            .config(config)
            .scenario(Arc::new(Tick))
            .build()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_handle_ends_the_run() {
        let mut config = config();
        config.load = LoadProfile::fixed(2, Duration::from_secs(3_600));
        let test = LoadTest::builder().config(config).scenario(Arc::new(Tick)).build();

        let stop = test.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stop.stop();
        });
        let outcome = test.run().await.unwrap();
        assert!(outcome.execution.stopped_early);
        assert!(!outcome.execution.hard_cancelled);
    }
}
