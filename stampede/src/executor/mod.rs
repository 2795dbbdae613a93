//! Executor: drives virtual users against a concurrency schedule.
//!
//! The [`Executor`] trait is the runtime hook that runs a scenario. The built-in
//! [`RampingVuExecutor`] keeps a pool of VU tasks whose size follows a
//! [`StageSchedule`]: a list of `{duration, target}` stages linearly
//! interpolated into a live target.
//!
//! # High-level flow
//! 1. Every `tick` the executor reads the live target from the schedule.
//! 2. If the pool is smaller, new VUs are spawned with their first iteration
//!    spread evenly across the coming tick so they do not fire in lockstep.
//! 3. If the pool is larger, the newest VUs are asked to retire. A retiring VU
//!    finishes the iteration it is in, then exits.
//! 4. Once the last stage is over the target is 0. The executor waits for the
//!    pool to drain, at most for the schedule's graceful stop, then cancels
//!    whatever is still running and joins every task.
//!
//! Each VU runs its iterations strictly one after another. Iteration failures
//! are recorded as samples and never end a VU.
//!
//! # Tuning knobs
//! - `tick`: how often the pool is reconciled with the schedule. The pool
//!   matches the target within one tick. Defaults to 1s.
//! - `graceful_stop` (on the schedule): how long in-flight iterations may run
//!   after the last stage or a [`StopHandle::stop`].
pub mod ramping;
pub mod schedule;
pub mod vu;

pub use ramping::{ExecutionReport, RampingVuExecutor, StopHandle, TickRecord};
pub use schedule::{Phase, Stage, StageSchedule};
pub use vu::{VirtualUser, VuReport, VuState};

use crate::{error::Result, scenario::ScenarioRunner};

pub trait Executor
where
    Self: Send + Sync + Sized,
{
    /// Execute the scenario until the schedule ends or a stop is requested.
    fn exec(
        &self,
        runner: &ScenarioRunner,
    ) -> impl Future<Output = Result<ExecutionReport>> + Send;
}
