//! A single virtual user: one tokio task running iterations back to back.
use serde::Serialize;
use std::time::Duration;
use tokio::{
    sync::watch::{self, Receiver, Sender},
    task::{JoinError, JoinHandle},
};

use crate::scenario::ScenarioRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VuState {
    /// Waiting for its start offset or thinking between iterations.
    Idle,
    /// Inside an iteration.
    Running,
    Stopped,
}

/// How a VU task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VuReport {
    pub id: u64,
    pub iterations: u64,
    /// `true` if the VU was cancelled mid-flight instead of retiring after an iteration.
    pub aborted: bool,
}

/// Shared by every VU of a run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub runner: ScenarioRunner,
    /// Hard cancellation: in-flight iterations are dropped.
    pub abort: Receiver<bool>,
}

impl ExecutionContext {
    pub fn new(runner: ScenarioRunner) -> (Self, Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { runner, abort: rx }, tx)
    }
}

/// Handle the runtime keeps for each spawned VU.
#[derive(Debug)]
pub struct VirtualUser {
    id: u64,
    state: Receiver<VuState>,
    retire: Sender<bool>,
    handle: JoinHandle<VuReport>,
}

impl VirtualUser {
    /// Spawns the VU task. The first iteration starts after `offset`.
    pub fn spawn(ctx: ExecutionContext, id: u64, offset: Duration) -> Self {
        let (retire_tx, retire_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(VuState::Idle);
        let handle = tokio::spawn(vu_task(ctx, id, offset, retire_rx, state_tx));
        Self {
            id,
            state: state_rx,
            retire: retire_tx,
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        *self.state.borrow()
    }

    /// Asks the VU to stop once its current iteration is over.
    pub fn retire(&self) {
        self.retire.send_replace(true);
    }

    pub fn is_retiring(&self) -> bool {
        *self.retire.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<VuReport, JoinError> {
        self.handle.await
    }
}

async fn vu_task(
    ctx: ExecutionContext,
    id: u64,
    offset: Duration,
    mut retire: Receiver<bool>,
    state: Sender<VuState>,
) -> VuReport {
    let ExecutionContext { runner, mut abort } = ctx;
    let mut iterations = 0;

    let main_task = async {
        if !offset.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(offset) => {}
                Ok(_) = retire.wait_for(|b| *b) => return,
            }
        }
        tracing::debug!("VU {id} started");
        loop {
            if *retire.borrow() {
                break;
            }
            state.send_replace(VuState::Running);
            let _ = runner.run_iteration(id, iterations).await;
            iterations += 1;
            state.send_replace(VuState::Idle);
            if !runner.think(&mut retire).await {
                break;
            }
        }
    };

    let aborted = tokio::select! {
        _ = main_task => false,
        _ = abort.wait_for(|b| *b) => true,
    };
    state.send_replace(VuState::Stopped);
    tracing::debug!("VU {id} stopped after {iterations} iterations");

    VuReport {
        id,
        iterations,
        aborted,
    }
}
