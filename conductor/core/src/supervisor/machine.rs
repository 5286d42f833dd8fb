//! Supervisor state machine
//!
//! Pure bookkeeping: no I/O, no publishing. Every transition returns the
//! events it implies so the caller can publish them after the lock is gone.

use crate::events::{AgentEvent, SupervisorState};
use crate::tasks::{PendingTask, TaskId};

use super::SupervisorError;

/// Notice published when the agent process goes away
pub const PROCESS_STOPPED: &str = "process stopped";

#[derive(Debug, Default)]
pub(crate) struct Machine {
    state: SupervisorState,
    pending: Option<PendingTask>,
}

impl Machine {
    pub(crate) fn state(&self) -> SupervisorState {
        self.state
    }

    pub(crate) fn pending(&self) -> Option<&PendingTask> {
        self.pending.as_ref()
    }

    /// A freshly spawned process is starting
    pub(crate) fn begin_start(&mut self) -> AgentEvent {
        self.state = SupervisorState::Starting;
        self.pending = None;
        AgentEvent::StateChanged(SupervisorState::Starting)
    }

    /// Transition implied by an event decoded from the agent's output
    ///
    /// Only readiness (while starting) and task completion (while running)
    /// move the machine.
    pub(crate) fn observe(&mut self, event: &AgentEvent) -> Option<AgentEvent> {
        match (event, self.state) {
            (AgentEvent::ReadinessChanged(true), SupervisorState::Starting) => {
                self.state = SupervisorState::Ready;
                Some(AgentEvent::StateChanged(SupervisorState::Ready))
            }
            (AgentEvent::TaskDone, SupervisorState::Running) => {
                self.state = SupervisorState::Ready;
                self.pending = None;
                Some(AgentEvent::StateChanged(SupervisorState::Ready))
            }
            _ => None,
        }
    }

    /// Claim the agent for one task
    ///
    /// Succeeds only in `Ready`; the machine moves to `Running` with the task
    /// pending.
    pub(crate) fn reserve(&mut self, text: String) -> Result<PendingTask, SupervisorError> {
        match self.state {
            SupervisorState::Ready => {
                let task = PendingTask::new(text);
                self.state = SupervisorState::Running;
                self.pending = Some(task.clone());
                Ok(task)
            }
            SupervisorState::Running => Err(SupervisorError::Busy {
                task_id: self
                    .pending
                    .as_ref()
                    .map_or_else(|| TaskId::new("unknown"), |p| p.id.clone()),
            }),
            state => Err(SupervisorError::NotReady { state }),
        }
    }

    /// Undo a reservation whose write failed
    ///
    /// A no-op unless `task_id` is still the pending task.
    pub(crate) fn release(&mut self, task_id: &TaskId) -> Option<AgentEvent> {
        let matches = self.pending.as_ref().is_some_and(|p| &p.id == task_id);
        if matches && self.state == SupervisorState::Running {
            self.state = SupervisorState::Ready;
            self.pending = None;
            Some(AgentEvent::StateChanged(SupervisorState::Ready))
        } else {
            None
        }
    }

    /// Go to `Disconnected`, whatever the current state
    ///
    /// Returns the disconnect notices, or nothing if already disconnected.
    pub(crate) fn disconnect(&mut self) -> Vec<AgentEvent> {
        let previous = std::mem::take(&mut self.state);
        self.pending = None;
        if previous == SupervisorState::Disconnected {
            return Vec::new();
        }
        vec![
            AgentEvent::system(PROCESS_STOPPED),
            AgentEvent::ReadinessChanged(false),
            AgentEvent::StateChanged(SupervisorState::Disconnected),
        ]
    }
}
