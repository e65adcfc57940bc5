//! Suspend/resume task tracking
//!
//! Each suspend step opens a set of pending tasks and holds the caller's
//! reply. The state advances, and the reply is resolved, only once the set
//! is empty. Every task currently completes within the call that starts it,
//! but completion is reported separately so a task can become asynchronous
//! without changing this contract.

use crate::error::{BluetoothError, HostResult};
use crate::reply::Responder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendResumeState {
    Running,
    SuspendImminent,
    SuspendImminentAcked,
    SuspendDone,
}

impl std::fmt::Display for SuspendResumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::SuspendImminent => write!(f, "SuspendImminent"),
            Self::SuspendImminentAcked => write!(f, "SuspendImminentAcked"),
            Self::SuspendDone => write!(f, "SuspendDone"),
        }
    }
}

/// Work that must finish before a suspend step is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendTask {
    PauseUnpauseDiscovery,
}

#[derive(Debug)]
pub struct SuspendTracker {
    state: SuspendResumeState,
    pending: HashSet<SuspendTask>,
    imminent_reply: Option<Responder>,
    done_reply: Option<Responder>,
    /// First failure seen by a task of the current step
    step_error: Option<BluetoothError>,
}

impl Default for SuspendTracker {
    fn default() -> Self {
        Self {
            state: SuspendResumeState::Running,
            pending: HashSet::new(),
            imminent_reply: None,
            done_reply: None,
            step_error: None,
        }
    }
}

impl SuspendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SuspendResumeState {
        self.state
    }

    pub fn is_pending(&self, task: SuspendTask) -> bool {
        self.pending.contains(&task)
    }

    /// Enter `SuspendImminent` and hold `reply` until its tasks finish
    pub fn suspend_imminent(&mut self, reply: Responder) {
        if self.state != SuspendResumeState::Running {
            warn!("SuspendImminent received in unexpected state {}", self.state);
        }
        if let Some(previous) = self.imminent_reply.replace(reply) {
            previous.reply_err(BluetoothError::Failed("Superseded".to_string()));
        }
        self.begin_step(SuspendResumeState::SuspendImminent);
    }

    /// Enter `SuspendDone` and hold `reply` until its tasks finish
    pub fn suspend_done(&mut self, reply: Responder) {
        if self.state != SuspendResumeState::SuspendImminentAcked {
            warn!("SuspendDone received in unexpected state {}", self.state);
        }
        if let Some(previous) = self.done_reply.replace(reply) {
            previous.reply_err(BluetoothError::Failed("Superseded".to_string()));
        }
        self.begin_step(SuspendResumeState::SuspendDone);
    }

    fn begin_step(&mut self, state: SuspendResumeState) {
        info!("Suspend/resume state {} -> {}", self.state, state);
        self.state = state;
        self.pending.clear();
        self.pending.insert(SuspendTask::PauseUnpauseDiscovery);
        self.step_error = None;
    }

    /// Report a finished task. The step advances once nothing is pending.
    pub fn complete_task(&mut self, task: SuspendTask, result: HostResult<()>) {
        if !self.pending.remove(&task) {
            debug!("Ignoring completion of {:?}, not pending", task);
            return;
        }
        if let Err(e) = result {
            warn!("Suspend task {:?} failed in {}: {}", task, self.state, e);
            self.step_error.get_or_insert(e);
        }
        if !self.pending.is_empty() {
            return;
        }

        let (next, reply) = match self.state {
            SuspendResumeState::SuspendImminent => (
                SuspendResumeState::SuspendImminentAcked,
                self.imminent_reply.take(),
            ),
            SuspendResumeState::SuspendDone => {
                (SuspendResumeState::Running, self.done_reply.take())
            }
            other => {
                debug!("No step to advance from {}", other);
                return;
            }
        };

        info!("Suspend/resume state {} -> {}", self.state, next);
        self.state = next;
        let result = match self.step_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if let Some(reply) = reply {
            reply.send(result);
        }
    }
}
