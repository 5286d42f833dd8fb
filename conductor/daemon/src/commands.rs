//! Supervisor command loop
//!
//! One task owns the [`Supervisor`] and applies lifecycle commands in the
//! order they arrive, so a restart requested by one surface can never
//! interleave with a task sent by another. Surfaces talk to it through a
//! cloneable [`SupervisorHandle`].

use agent_conductor::{
    AgentEvent, AgentSettings, Broadcaster, CallbackSink, PendingTask, Supervisor,
    SupervisorState,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A lifecycle request for the command loop
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Launch (or relaunch) the agent
    Start(AgentSettings),
    /// Submit a task
    Send(String),
    /// Stop the agent
    Stop,
    /// Report the current status
    Status(oneshot::Sender<StatusReport>),
    /// Stop the agent and end the loop
    Shutdown,
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Current state
    pub state: SupervisorState,
    /// Provider and model of the last launch
    pub settings: AgentSettings,
    /// PID of the live child
    pub pid: Option<u32>,
    /// The in-flight task
    pub pending: Option<PendingTask>,
}

/// The command loop is gone
#[derive(Debug, Error, PartialEq, Eq)]
#[error("supervisor command loop has stopped")]
pub struct LoopClosed;

/// Cloneable handle used by surfaces
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<SupervisorState>,
    defaults: AgentSettings,
}

impl SupervisorHandle {
    /// Latest supervisor state
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Configured provider and model
    #[must_use]
    pub fn defaults(&self) -> &AgentSettings {
        &self.defaults
    }

    /// Start the agent; missing fields fall back to the configured defaults
    pub async fn start(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), LoopClosed> {
        let settings = self.defaults.with_overrides(provider, model);
        self.submit(SupervisorCommand::Start(settings)).await
    }

    /// Submit a task
    pub async fn send(&self, text: impl Into<String>) -> Result<(), LoopClosed> {
        self.submit(SupervisorCommand::Send(text.into())).await
    }

    /// Stop the agent
    pub async fn stop(&self) -> Result<(), LoopClosed> {
        self.submit(SupervisorCommand::Stop).await
    }

    /// Stop the agent and end the command loop
    pub async fn shutdown(&self) -> Result<(), LoopClosed> {
        self.submit(SupervisorCommand::Shutdown).await
    }

    /// Ask the loop for a status report
    pub async fn status(&self) -> Result<StatusReport, LoopClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(SupervisorCommand::Status(reply_tx)).await?;
        reply_rx.await.map_err(|_| LoopClosed)
    }

    async fn submit(&self, command: SupervisorCommand) -> Result<(), LoopClosed> {
        self.tx.send(command).await.map_err(|_| LoopClosed)
    }
}

/// Spawn the command loop for `supervisor`
///
/// The returned join handle completes after [`SupervisorCommand::Shutdown`]
/// or once every handle has been dropped; the agent is stopped either way.
pub fn spawn_command_loop(
    supervisor: Supervisor,
    capacity: usize,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let state = track_state(supervisor.broadcaster(), supervisor.state());
    let handle = SupervisorHandle {
        tx,
        state,
        defaults: supervisor.settings().clone(),
    };
    let task = tokio::spawn(run_command_loop(supervisor, rx));
    (handle, task)
}

fn track_state(
    broadcaster: &Broadcaster,
    initial: SupervisorState,
) -> watch::Receiver<SupervisorState> {
    let (state_tx, state_rx) = watch::channel(initial);
    broadcaster.subscribe_labeled(
        "state-tracker",
        CallbackSink::new(move |event: &AgentEvent| {
            if let AgentEvent::StateChanged(state) = event {
                state_tx.send_replace(*state);
            }
            Ok(())
        }),
    );
    state_rx
}

async fn run_command_loop(mut supervisor: Supervisor, mut rx: mpsc::Receiver<SupervisorCommand>) {
    info!("Command loop started");

    while let Some(command) = rx.recv().await {
        match command {
            SupervisorCommand::Start(settings) => {
                if let Err(e) = supervisor.start(settings).await {
                    debug!(error = %e, "Start failed");
                }
            }
            SupervisorCommand::Send(text) => {
                if let Err(e) = supervisor.send(&text).await {
                    debug!(error = %e, "Send failed");
                }
            }
            SupervisorCommand::Stop => {
                supervisor.stop().await;
            }
            SupervisorCommand::Status(reply) => {
                let _ = reply.send(StatusReport {
                    state: supervisor.state(),
                    settings: supervisor.settings().clone(),
                    pid: supervisor.child_pid(),
                    pending: supervisor.pending_task(),
                });
            }
            SupervisorCommand::Shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    supervisor.stop().await;
    info!("Command loop finished");
}
