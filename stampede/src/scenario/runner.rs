use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc, time::Instant};
use tokio::sync::watch;

use super::{IterationContext, IterationOutcome, Recorder, Scenario, ScenarioError};
use crate::{
    config::ThinkTime,
    metric::{Sample, names},
};

/// Runs single iterations of a scenario on behalf of a VU and records the
/// iteration-level metrics (`iterations`, `iteration_duration`, `errors{kind=iteration}`).
#[derive(Clone)]
pub struct ScenarioRunner {
    scenario: Arc<dyn Scenario>,
    recorder: Recorder,
    think_time: ThinkTime,
}

impl std::fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("scenario", &self.scenario.name())
            .field("think_time", &self.think_time)
            .finish()
    }
}

impl ScenarioRunner {
    pub fn new(scenario: Arc<dyn Scenario>, recorder: Recorder, think_time: ThinkTime) -> Self {
        Self {
            scenario,
            recorder,
            think_time,
        }
    }

    pub fn name(&self) -> &str {
        self.scenario.name()
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Runs one iteration to completion. A failed or panicking iteration is
    /// recorded and returned; it never ends the VU.
    pub async fn run_iteration(
        &self,
        vu_id: u64,
        iteration: u64,
    ) -> Result<IterationOutcome, ScenarioError> {
        let ctx = IterationContext {
            vu_id,
            iteration,
            recorder: self.recorder.clone(),
        };

        let start = Instant::now();
        let result = AssertUnwindSafe(self.scenario.run(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ScenarioError::custom("scenario panicked")));
        let millis = start.elapsed().as_secs_f64() * 1_000.0;

        let scenario = self.scenario.name();
        self.recorder
            .record(Sample::counter(names::ITERATIONS, 1.0).with_tag("scenario", scenario));
        self.recorder
            .record(Sample::trend(names::ITERATION_DURATION, millis).with_tag("scenario", scenario));

        if let Err(e) = &result {
            tracing::debug!("VU {vu_id} iteration {iteration} failed: {e}");
            self.recorder.record(
                Sample::counter(names::ERRORS, 1.0)
                    .with_tag("kind", "iteration")
                    .with_tag("scenario", scenario),
            );
        }
        result
    }

    /// Sleeps the think time between two iterations.
    ///
    /// Returns `false` if `retire` fired first, meaning the VU should not start another iteration.
    pub async fn think(&self, retire: &mut watch::Receiver<bool>) -> bool {
        let pause = self.think_time.sample();
        if pause.is_zero() {
            // iterations that never await must still let other VUs run
            tokio::task::yield_now().await;
            return !*retire.borrow();
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => true,
            Ok(_) = retire.wait_for(|b| *b) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Aggregator, metric::Tags};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Flaky;

    #[async_trait]
    impl Scenario for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, ctx: &IterationContext) -> Result<IterationOutcome, ScenarioError> {
            if ctx.iteration == 5 {
                panic!("boom");
            }
            if ctx.iteration % 2 == 1 {
                return Err(ScenarioError::custom("odd iteration"));
            }
            Ok(IterationOutcome::default())
        }
    }

    fn runner(think_time: ThinkTime) -> (ScenarioRunner, Arc<Aggregator>) {
        let agg = Arc::new(Aggregator::new());
        let recorder = Recorder::new(
            agg.clone(),
            Tags::from([("test_type".to_string(), "unit".to_string())]),
        );
        (ScenarioRunner::new(Arc::new(Flaky), recorder, think_time), agg)
    }

    #[tokio::test]
    async fn records_iterations_and_failures() {
        let (runner, agg) = runner(ThinkTime::None);
        for i in 0..4 {
            let _ = runner.run_iteration(1, i).await;
        }
        let summary = agg.snapshot();
        assert_eq!(summary.counter_total(names::ITERATIONS), 4.0);
        assert_eq!(summary.trend_count(names::ITERATION_DURATION), 4);
        assert_eq!(summary.counter_total(names::ERRORS), 2.0);

        let tags = Tags::from([
            ("kind".to_string(), "iteration".to_string()),
            ("scenario".to_string(), "flaky".to_string()),
            ("test_type".to_string(), "unit".to_string()),
        ]);
        assert!(summary.get(names::ERRORS, &tags).is_some());
    }

    #[tokio::test]
    async fn panicking_iteration_is_an_error() {
        let (runner, agg) = runner(ThinkTime::None);
        let err = runner.run_iteration(1, 5).await.unwrap_err();
        assert_eq!(err, ScenarioError::custom("scenario panicked"));
        assert_eq!(agg.snapshot().counter_total(names::ERRORS), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn think_is_cut_short_by_retire() {
        let (runner, _) = runner(ThinkTime::Fixed(Duration::from_secs(60)));
        let (tx, mut rx) = watch::channel(false);

        let think = tokio::spawn(async move { runner.think(&mut rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        assert!(!think.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn think_completes_without_retire() {
        let (runner, _) = runner(ThinkTime::Fixed(Duration::from_millis(100)));
        let (_tx, mut rx) = watch::channel(false);
        assert!(runner.think(&mut rx).await);
    }
}
