//! Deterministic concurrency signal derived from a list of [`Stage`]s.
//!
//! For a stage ramping from `start` (the previous stage's target, or the
//! schedule's start target for the first stage) to `end` over `duration`, the
//! target at `elapsed` inside that stage is:
//!
//! ```text
//! t = (elapsed - stage_start) / duration
//! target(t) = round(start + (end - start) * t)
//! ```
//!
//! A stage with a zero duration jumps to its target instantly. Once the total
//! duration is reached the signal drops to 0 so the runtime drains every VU.
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_str;

/// A stage defines a target number of concurrent VUs and how long to ramp to it.
///
/// Use `Stage::new(Duration::from_secs(60), 100)` to ramp to 100 VUs over a minute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration_str")]
    pub duration: Duration,
    /// Concurrent VUs to reach at the end of the stage
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Where a run is relative to its schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Inside the configured stages.
    Ramping,
    /// Past the last stage, in-flight iterations may still finish.
    Draining,
    /// The graceful window is over; anything still running gets cancelled.
    Finished,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageSchedule {
    start_target: u64,
    stages: Vec<Stage>,
    total: Duration,
    graceful_stop: Duration,
}

impl StageSchedule {
    pub fn new(start_target: u64, stages: Vec<Stage>) -> Self {
        let total = stages.iter().map(|s| s.duration).sum();
        Self {
            start_target,
            stages,
            total,
            graceful_stop: Duration::ZERO,
        }
    }

    /// `concurrency` VUs for the whole `duration`.
    pub fn constant(concurrency: u64, duration: Duration) -> Self {
        Self::new(concurrency, vec![Stage::new(duration, concurrency)])
    }

    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_target(&self) -> u64 {
        self.start_target
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn graceful_stop(&self) -> Duration {
        self.graceful_stop
    }

    /// Largest target the schedule ever asks for.
    pub fn max_target(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, u64::max)
    }

    /// The raw interpolated target, held at the final stage's target past the end.
    pub fn interpolated(&self, elapsed: Duration) -> f64 {
        let mut from = self.start_target as f64;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let to = stage.target as f64;
            if stage.duration.is_zero() {
                from = to;
                continue;
            }
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let t = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                return from + (to - from) * t;
            }
            from = to;
            stage_start = stage_end;
        }
        from
    }

    /// Target concurrency at `elapsed`, rounded to the nearest integer.
    /// Zero at and after the end of the last stage.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        if elapsed >= self.total {
            return 0;
        }
        self.interpolated(elapsed).round().max(0.0) as u64
    }

    pub fn phase_at(&self, elapsed: Duration) -> Phase {
        if elapsed < self.total {
            Phase::Ramping
        } else if elapsed < self.total + self.graceful_stop {
            Phase::Draining
        } else {
            Phase::Finished
        }
    }

    /// Index of the stage running at `elapsed`, `None` once all stages are over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration;
            if elapsed < stage_end {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn original_search_profile() -> StageSchedule {
        StageSchedule::new(
            0,
            vec![
                Stage::new(secs(30), 1),
                Stage::new(secs(60), 10),
                Stage::new(secs(60), 100),
                Stage::new(secs(60), 1000),
                Stage::new(secs(30), 0),
            ],
        )
    }

    #[test]
    fn starts_at_start_target_and_ends_at_zero() {
        let profiles = [
            original_search_profile(),
            StageSchedule::new(5, vec![Stage::new(secs(10), 20)]),
            StageSchedule::constant(100, secs(240)),
            StageSchedule::new(0, vec![Stage::new(Duration::ZERO, 7), Stage::new(secs(3), 7)]),
        ];
        for p in profiles {
            let expected_start = if p.stages()[0].duration.is_zero() {
                p.stages()[0].target
            } else {
                p.start_target()
            };
            assert_eq!(p.target_at(Duration::ZERO), expected_start, "{p:?}");
            assert_eq!(p.target_at(p.total_duration()), 0, "{p:?}");
        }
    }

    #[test]
    fn ramp_up_is_linear() {
        let s = StageSchedule::new(0, vec![Stage::new(secs(10), 100)]);
        for i in 0..10 {
            assert_eq!(s.target_at(secs(i)), i * 10);
        }
    }

    #[test]
    fn ramp_down_is_linear() {
        let s = StageSchedule::new(100, vec![Stage::new(secs(10), 0)]);
        for i in 0..10 {
            assert_eq!(s.target_at(secs(i)), 100 - i * 10);
        }
    }

    #[test]
    fn rounds_to_nearest() {
        let s = StageSchedule::new(0, vec![Stage::new(secs(4), 1)]);
        assert_eq!(s.target_at(Duration::from_millis(1900)), 0);
        assert_eq!(s.target_at(Duration::from_millis(2100)), 1);
    }

    #[test]
    fn next_stage_starts_from_previous_target() {
        let s = original_search_profile();
        assert_eq!(s.target_at(secs(30)), 1);
        assert_eq!(s.target_at(secs(60)), 6); // 1 + 9 * 0.5 = 5.5
        assert_eq!(s.target_at(secs(90)), 10);
        assert_eq!(s.target_at(secs(210)), 1000);
        assert_eq!(s.target_at(secs(225)), 500);
    }

    #[test]
    fn interpolation_is_held_after_the_end() {
        let s = StageSchedule::new(0, vec![Stage::new(secs(5), 40)]);
        assert_eq!(s.interpolated(secs(5)), 40.0);
        assert_eq!(s.interpolated(secs(500)), 40.0);
        assert_eq!(s.target_at(secs(500)), 0);
    }

    #[test]
    fn zero_duration_stage_jumps() {
        let s = StageSchedule::new(
            0,
            vec![
                Stage::new(secs(10), 10),
                Stage::new(Duration::ZERO, 50),
                Stage::new(secs(10), 50),
            ],
        );
        assert_eq!(s.target_at(secs(9)), 9);
        assert_eq!(s.target_at(secs(10)), 50);
        assert_eq!(s.target_at(secs(15)), 50);
    }

    #[test]
    fn phases_follow_the_graceful_window() {
        let s = StageSchedule::constant(3, secs(10)).with_graceful_stop(secs(5));
        assert_eq!(s.phase_at(secs(0)), Phase::Ramping);
        assert_eq!(s.phase_at(secs(10)), Phase::Draining);
        assert_eq!(s.phase_at(secs(14)), Phase::Draining);
        assert_eq!(s.phase_at(secs(15)), Phase::Finished);
    }

    #[test]
    fn stage_index_tracks_boundaries() {
        let s = original_search_profile();
        assert_eq!(s.stage_index_at(secs(0)), Some(0));
        assert_eq!(s.stage_index_at(secs(30)), Some(1));
        assert_eq!(s.stage_index_at(secs(239)), Some(4));
        assert_eq!(s.stage_index_at(secs(240)), None);
        assert_eq!(s.max_target(), 1000);
    }

    #[test]
    fn is_deterministic() {
        let a = original_search_profile();
        let b = original_search_profile();
        for ms in (0..250_000).step_by(733) {
            let t = Duration::from_millis(ms);
            assert_eq!(a.target_at(t), b.target_at(t));
        }
    }
}
