use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch::{self, Receiver, Sender},
    time::{Instant, MissedTickBehavior},
};
use typed_builder::TypedBuilder;

use super::{
    Executor,
    schedule::{Phase, StageSchedule},
    vu::{ExecutionContext, VirtualUser, VuReport},
};
use crate::{config::RunConfig, error::Result, scenario::ScenarioRunner};
use internals::*;

use futures::future::join_all;

/// Requests a graceful stop of a running executor from anywhere.
///
/// After `stop()` no new VU is started, every VU retires after its current
/// iteration and whatever is still running after the graceful window is cancelled.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> Receiver<bool> {
        self.tx.subscribe()
    }
}

/// One reconciliation step of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickRecord {
    pub elapsed: Duration,
    pub target: u64,
    /// VUs not asked to retire after this tick's reconciliation.
    pub active: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    /// Ticks where the target or the active count changed; the first tick is always kept.
    pub timeline: Vec<TickRecord>,
    pub peak_vus: u64,
    pub vus_spawned: u64,
    pub iterations: u64,
    /// VU tasks that died from a panic outside the scenario.
    pub vus_failed: u64,
    /// Some VUs were still running when the graceful window closed.
    pub hard_cancelled: bool,
    /// The run was cut short by a [`StopHandle`].
    pub stopped_early: bool,
    pub elapsed: Duration,
}

impl ExecutionReport {
    fn record_tick(&mut self, elapsed: Duration, target: u64, active: u64) {
        self.peak_vus = self.peak_vus.max(active);
        if self
            .timeline
            .last()
            .is_some_and(|last| last.target == target && last.active == active)
        {
            return;
        }
        self.timeline.push(TickRecord {
            elapsed,
            target,
            active,
        });
    }
}

/// Executor that keeps the number of concurrent VUs equal to a [`StageSchedule`].
///
/// - Every `tick` the live target is compared with the active pool.
/// - Growth spawns VUs whose first iterations are spread across one tick.
/// - Shrinking retires the newest VUs first; each finishes its iteration.
/// - Past the last stage every VU retires and the executor waits up to the
///   schedule's graceful stop before cancelling what is left.
#[derive(Debug, TypedBuilder)]
pub struct RampingVuExecutor {
    pub schedule: StageSchedule,
    #[builder(default = Duration::from_secs(1))]
    pub tick: Duration,
    #[builder(default)]
    pub stop: StopHandle,
}

impl RampingVuExecutor {
    pub fn from_config(config: &RunConfig, stop: StopHandle) -> Self {
        Self::builder()
            .schedule(config.schedule())
            .tick(config.tick)
            .stop(stop)
            .build()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}

impl Executor for RampingVuExecutor {
    async fn exec(&self, runner: &ScenarioRunner) -> Result<ExecutionReport> {
        let (ctx, abort_tx) = ExecutionContext::new(runner.clone());
        let mut pool = VuPool::new(ctx);
        let mut report = ExecutionReport::default();
        let mut stop = self.stop.subscribe();
        let mut stopped_at: Option<Duration> = None;
        let mut stage = None;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Running scenario {} over {:?} ({} stages, up to {} VUs)",
            runner.name(),
            self.schedule.total_duration(),
            self.schedule.stages().len(),
            self.schedule.max_target()
        );
        let start = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Ok(_) = stop.wait_for(|b| *b), if stopped_at.is_none() => {}
            }
            let elapsed = start.elapsed();

            if stopped_at.is_none() && *stop.borrow() {
                tracing::info!("Stop requested after {elapsed:?}, retiring all VUs");
                stopped_at = Some(elapsed);
                report.stopped_early = true;
            }
            let phase = match stopped_at {
                Some(at) if elapsed >= at + self.schedule.graceful_stop() => Phase::Finished,
                Some(_) => Phase::Draining,
                None => self.schedule.phase_at(elapsed),
            };
            let target = match phase {
                Phase::Ramping => self.schedule.target_at(elapsed),
                _ => 0,
            };

            let current = self.schedule.stage_index_at(elapsed).filter(|_| stopped_at.is_none());
            if current != stage {
                match current {
                    Some(i) => {
                        let s = self.schedule.stages()[i];
                        tracing::info!("Stage {}: {} VUs over {:?}", i + 1, s.target, s.duration);
                    }
                    None => tracing::info!("No stage running, draining VUs"),
                }
                stage = current;
            }

            pool.reap(&mut report).await;
            pool.scale_to(target, self.tick);
            report.record_tick(elapsed, target, pool.active());

            match phase {
                Phase::Ramping => {}
                Phase::Draining if pool.is_drained() => break,
                Phase::Draining => {}
                Phase::Finished => {
                    if !pool.is_drained() {
                        tracing::warn!(
                            "Graceful stop elapsed with {} VUs still running, cancelling",
                            pool.live()
                        );
                        report.hard_cancelled = true;
                        abort_tx.send_replace(true);
                    }
                    break;
                }
            }
        }

        tracing::info!("Waiting for VUs to finish...");
        report.vus_spawned = pool.spawned();
        pool.join(&mut report).await;
        report.elapsed = start.elapsed();

        tracing::info!(
            "Done running scenario {}: {} iterations by {} VUs in {:?}",
            runner.name(),
            report.iterations,
            report.vus_spawned,
            report.elapsed
        );
        Ok(report)
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

mod internals {
    use super::*;

    /// Start delay of the `i`-th of `n` VUs spawned on the same tick, spreading
    /// them evenly over `[0, tick)`.
    pub fn phase_offset(i: u64, n: u64, tick: Duration) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        tick.mul_f64(i as f64 / n as f64)
    }

    /// The live VUs of a run.
    pub struct VuPool {
        ctx: ExecutionContext,
        next_id: u64,
        /// Oldest first; shrinking pops from the back.
        active: Vec<VirtualUser>,
        retiring: Vec<VirtualUser>,
    }

    impl VuPool {
        pub fn new(ctx: ExecutionContext) -> Self {
            Self {
                ctx,
                next_id: 0,
                active: Vec::new(),
                retiring: Vec::new(),
            }
        }

        pub fn active(&self) -> u64 {
            self.active.len() as u64
        }

        /// Every VU, retiring ones included.
        pub fn live(&self) -> usize {
            self.active.len() + self.retiring.len()
        }

        pub fn spawned(&self) -> u64 {
            self.next_id
        }

        pub fn is_drained(&self) -> bool {
            self.active.is_empty() && self.retiring.iter().all(VirtualUser::is_finished)
        }

        pub fn scale_to(&mut self, target: u64, tick: Duration) {
            let current = self.active();
            if target > current {
                let n = target - current;
                for i in 0..n {
                    self.next_id += 1;
                    let vu = VirtualUser::spawn(self.ctx.clone(), self.next_id, phase_offset(i, n, tick));
                    self.active.push(vu);
                }
                tracing::debug!("Pool grew by {n} to {target} VUs");
            } else if target < current {
                let retired = self.active.split_off(target as usize);
                for vu in retired.into_iter().rev() {
                    vu.retire();
                    self.retiring.push(vu);
                }
                tracing::debug!("Pool shrank by {} to {target} VUs", current - target);
            }
        }

        /// Collects VUs whose task already ended. An active VU that ended is
        /// replaced on the next reconciliation.
        pub async fn reap(&mut self, report: &mut ExecutionReport) {
            for list in [&mut self.active, &mut self.retiring] {
                let (done, live): (Vec<_>, Vec<_>) = std::mem::take(list)
                    .into_iter()
                    .partition(VirtualUser::is_finished);
                *list = live;
                for vu in done {
                    collect(vu.join().await, report);
                }
            }
        }

        pub async fn join(self, report: &mut ExecutionReport) {
            let all = self.active.into_iter().chain(self.retiring).map(VirtualUser::join);
            for result in join_all(all).await {
                collect(result, report);
            }
        }
    }

    fn collect(result: std::result::Result<VuReport, tokio::task::JoinError>, report: &mut ExecutionReport) {
        match result {
            Ok(vu) => report.iterations += vu.iterations,
            Err(e) => {
                tracing::error!("VU task failed: {e}");
                report.vus_failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Aggregator,
        config::ThinkTime,
        executor::Stage,
        metric::Tags,
        scenario::{IterationContext, IterationOutcome, Recorder, Scenario, ScenarioError},
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Sleepy {
        iteration: Duration,
        running: AtomicU64,
        peak: AtomicU64,
    }

    impl Sleepy {
        fn new(iteration: Duration) -> Arc<Self> {
            Arc::new(Self {
                iteration,
                running: AtomicU64::new(0),
                peak: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Scenario for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn run(&self, _: &IterationContext) -> std::result::Result<IterationOutcome, ScenarioError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.iteration).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(IterationOutcome::default())
        }
    }

    fn runner(scenario: Arc<Sleepy>) -> (ScenarioRunner, Arc<Aggregator>) {
        let agg = Arc::new(Aggregator::new());
        let recorder = Recorder::new(agg.clone(), Tags::new());
        (ScenarioRunner::new(scenario, recorder, ThinkTime::None), agg)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn offsets_spread_over_one_tick() {
        let tick = Duration::from_millis(1000);
        let offsets: Vec<_> = (0..4).map(|i| phase_offset(i, 4, tick)).collect();
        assert_eq!(offsets, [0, 250, 500, 750].map(Duration::from_millis));
        assert!(offsets.iter().all(|o| *o < tick));
        assert_eq!(phase_offset(0, 0, tick), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn active_pool_tracks_target_every_tick() {
        let scenario = Sleepy::new(Duration::from_millis(30));
        let (runner, agg) = runner(scenario.clone());
        let executor = RampingVuExecutor::builder()
            .schedule(
                StageSchedule::new(0, vec![Stage::new(secs(2), 10), Stage::new(secs(2), 0)])
                    .with_graceful_stop(secs(5)),
            )
            .tick(Duration::from_millis(100))
            .build();

        let report = executor.exec(&runner).await.unwrap();

        assert!(!report.timeline.is_empty());
        for tick in &report.timeline {
            assert_eq!(tick.active, tick.target, "{tick:?}");
        }
        assert_eq!(report.peak_vus, 10);
        assert!(scenario.peak.load(Ordering::SeqCst) <= 10);
        assert!(!report.hard_cancelled);
        assert_eq!(report.timeline.last().map(|t| t.target), Some(0));
        // 40 ticks, but only the changes are kept: 0->10 and back in single steps at most
        assert!(report.timeline.len() <= 21, "{}", report.timeline.len());
        assert!(report.timeline.windows(2).all(|w| (w[0].target, w[0].active) != (w[1].target, w[1].active)));
        assert_eq!(
            agg.snapshot().counter_total(crate::metric::names::ITERATIONS),
            report.iterations as f64
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_target_spawns_nothing() {
        let scenario = Sleepy::new(Duration::from_millis(10));
        let (runner, _) = runner(scenario.clone());
        let executor = RampingVuExecutor::builder()
            .schedule(StageSchedule::constant(0, secs(2)))
            .tick(Duration::from_millis(200))
            .build();

        let report = executor.exec(&runner).await.unwrap();
        assert_eq!(report.vus_spawned, 0);
        assert_eq!(report.iterations, 0);
        // ten idle ticks collapse into one entry
        assert_eq!(report.timeline.len(), 1);
        assert_eq!(scenario.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_retires_gracefully() {
        let scenario = Sleepy::new(Duration::from_millis(50));
        let (runner, _) = runner(scenario.clone());
        let executor = RampingVuExecutor::builder()
            .schedule(StageSchedule::constant(3, secs(3_600)).with_graceful_stop(secs(30)))
            .tick(Duration::from_millis(100))
            .build();

        let stop = executor.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(secs(1)).await;
            stop.stop();
        });

        let report = executor.exec(&runner).await.unwrap();
        assert!(report.stopped_early);
        assert!(!report.hard_cancelled);
        assert!(report.elapsed < secs(10));
        assert!(report.iterations > 0);
        assert_eq!(scenario.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_iterations_are_cancelled_after_grace() {
        let scenario = Sleepy::new(secs(3_600));
        let (runner, _) = runner(scenario);
        let executor = RampingVuExecutor::builder()
            .schedule(StageSchedule::constant(2, secs(1)).with_graceful_stop(secs(2)))
            .tick(Duration::from_millis(100))
            .build();

        let report = executor.exec(&runner).await.unwrap();
        assert!(report.hard_cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.vus_spawned, 2);
        assert!(report.elapsed < secs(4));
    }
}
