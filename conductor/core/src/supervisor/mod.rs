//! Agent Process Supervisor
//!
//! Owns the single agent child process and its lifecycle:
//!
//! ```text
//!                 start()                readiness sentinel
//! Disconnected ───────────▶ Starting ──────────────────────▶ Ready
//!      ▲                                                    │   ▲
//!      │ stop() / stdout EOF (from any state)       send()  │   │ completion marker
//!      │                                                    ▼   │
//!      └─────────────────────────────────────────────────── Running
//! ```
//!
//! Two reader tasks decode stdout and stderr concurrently and report back
//! through shared state. Every spawned process gets a new generation number;
//! readers of a replaced process are ignored, so a restart never mixes the
//! output of two children.
//!
//! Everything the supervisor has to say, errors included, goes out through
//! the [`Broadcaster`]. The `Result`s returned here mirror those events for
//! callers that want to branch on them.

mod machine;
mod reader;

pub use machine::PROCESS_STOPPED;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::{AgentConfig, AgentSettings, ConductorConfig, ProtocolConfig};
use crate::events::{AgentEvent, SupervisorState};
use crate::protocol::FramingDecoder;
use crate::tasks::{normalize_task_text, PendingTask, TaskId};

use machine::Machine;
use reader::{read_stderr, read_stdout, ReaderContext};

/// Supervisor errors
///
/// Each of these is also published as an `ErrorMessage` event.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `send` outside `Ready`
    #[error("agent is not ready (state: {state})")]
    NotReady {
        /// State at the time of the call
        state: SupervisorState,
    },

    /// `send` while a task is in flight
    #[error("agent is busy with task {task_id}")]
    Busy {
        /// The task still pending
        task_id: TaskId,
    },

    /// Task text was blank
    #[error("cannot send an empty task")]
    EmptyTask,

    /// Writing the task to the agent's stdin failed
    #[error("failed to write task to agent: {0}")]
    Write(#[source] std::io::Error),

    /// The agent executable could not be launched
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        /// Executable that was attempted
        program: String,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// The shared provider/model file could not be written
    #[error("failed to write shared config {path}: {source}")]
    SharedConfig {
        /// Target path
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// A spawned child came without one of its piped streams
    #[error("agent process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// State shared between the supervisor and its reader tasks
pub(crate) struct Shared {
    machine: Mutex<Machine>,
    /// Generation of the live process. Readers hold a read guard while they
    /// publish; teardown takes the write guard to retire them.
    generation: RwLock<u64>,
    broadcaster: Broadcaster,
}

impl Shared {
    pub(crate) fn new(broadcaster: Broadcaster) -> Self {
        Self {
            machine: Mutex::new(Machine::default()),
            generation: RwLock::new(0),
            broadcaster,
        }
    }

    fn publish(&self, event: &AgentEvent) {
        self.broadcaster.publish(event);
    }

    fn publish_error(&self, err: &SupervisorError) {
        self.publish(&AgentEvent::error(err.to_string()));
    }
}

struct AgentProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
    generation: u64,
    pid: Option<u32>,
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        for handle in &self.readers {
            handle.abort();
        }
    }
}

/// Supervisor for one external agent process
pub struct Supervisor {
    agent: AgentConfig,
    protocol: ProtocolConfig,
    settings: AgentSettings,
    shared: Arc<Shared>,
    process: Option<AgentProcess>,
}

impl Supervisor {
    /// Create a supervisor; nothing is spawned until [`Supervisor::start`]
    #[must_use]
    pub fn new(agent: AgentConfig, protocol: ProtocolConfig, broadcaster: Broadcaster) -> Self {
        let settings = agent.settings.clone();
        Self {
            agent,
            protocol,
            settings,
            shared: Arc::new(Shared::new(broadcaster)),
            process: None,
        }
    }

    /// Create a supervisor from a loaded configuration
    #[must_use]
    pub fn from_config(config: &ConductorConfig, broadcaster: Broadcaster) -> Self {
        Self::new(config.agent.clone(), config.protocol.clone(), broadcaster)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.shared.machine.lock().state()
    }

    /// Whether a task can be sent right now
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == SupervisorState::Ready
    }

    /// The in-flight task, if any
    #[must_use]
    pub fn pending_task(&self) -> Option<PendingTask> {
        self.shared.machine.lock().pending().cloned()
    }

    /// Generation of the most recently spawned process (0 before the first)
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.shared.generation.read()
    }

    /// PID of the live child process
    #[must_use]
    pub fn child_pid(&self) -> Option<u32> {
        if !self.state().is_live() {
            return None;
        }
        self.process.as_ref().and_then(|p| p.pid)
    }

    /// Provider and model of the last launch (configured defaults before it)
    #[must_use]
    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// The broadcaster all events go through
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.shared.broadcaster
    }

    /// Launch the agent with `settings`
    ///
    /// A running agent is stopped first and its teardown completes before
    /// the new child is spawned. On failure the supervisor stays
    /// `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::SharedConfig`] or [`SupervisorError::Spawn`]
    /// when the launch fails. The error is published as well.
    pub async fn start(&mut self, settings: AgentSettings) -> Result<(), SupervisorError> {
        if self.process.is_some() {
            info!("Restarting agent");
            self.stop().await;
        }
        self.settings = settings;

        if let Err(err) = self.write_shared_config().await {
            self.shared.publish_error(&err);
            return Err(err);
        }

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    program: self.agent.program.clone(),
                    source,
                };
                warn!(error = %err, "Failed to launch agent");
                self.shared.publish_error(&err);
                return Err(err);
            }
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            (stdin, stdout, _) => {
                let missing = if stdin.is_none() {
                    "stdin"
                } else if stdout.is_none() {
                    "stdout"
                } else {
                    "stderr"
                };
                let _ = child.start_kill();
                let err = SupervisorError::MissingPipe(missing);
                self.shared.publish_error(&err);
                return Err(err);
            }
        };

        let pid = child.id();
        let generation = {
            let mut gate = self.shared.generation.write();
            *gate += 1;
            let starting = self.shared.machine.lock().begin_start();
            self.shared.publish(&AgentEvent::system(format!(
                "starting agent ({})",
                self.settings
            )));
            self.shared.publish(&starting);
            *gate
        };

        info!(
            generation,
            pid = pid.unwrap_or_default(),
            provider = %self.settings.provider,
            model = %self.settings.model,
            "Agent process spawned"
        );

        let ctx = ReaderContext::new(Arc::clone(&self.shared), generation);
        let readers = vec![
            tokio::spawn(read_stdout(
                stdout,
                FramingDecoder::new(self.protocol.framing()),
                ctx.clone(),
            )),
            tokio::spawn(read_stderr(stderr, self.protocol.stderr_classifier(), ctx)),
        ];

        self.process = Some(AgentProcess {
            child,
            stdin: Some(stdin),
            readers,
            generation,
            pid,
        });
        Ok(())
    }

    /// Submit one task to the agent
    ///
    /// Valid only in `Ready`. Line breaks in `text` are flattened to spaces.
    ///
    /// # Errors
    ///
    /// Rejections ([`SupervisorError::NotReady`], [`SupervisorError::Busy`],
    /// [`SupervisorError::EmptyTask`]) leave the state untouched. A failed
    /// write ([`SupervisorError::Write`]) returns the agent to `Ready`.
    /// Exactly one `ErrorMessage` is published in every case.
    pub async fn send(&mut self, text: &str) -> Result<TaskId, SupervisorError> {
        let Some(line) = normalize_task_text(text) else {
            let err = SupervisorError::EmptyTask;
            self.shared.publish_error(&err);
            return Err(err);
        };

        let reserved = self.shared.machine.lock().reserve(line);
        let task = match reserved {
            Ok(task) => task,
            Err(err) => {
                debug!(error = %err, "Task rejected");
                self.shared.publish_error(&err);
                return Err(err);
            }
        };
        self.shared
            .publish(&AgentEvent::StateChanged(SupervisorState::Running));

        if let Err(source) = self.write_task(&task.text).await {
            let err = SupervisorError::Write(source);
            warn!(task_id = %task.id, error = %err, "Failed to submit task");
            let rollback = self.shared.machine.lock().release(&task.id);
            self.shared.publish_error(&err);
            if let Some(event) = rollback {
                self.shared.publish(&event);
            }
            return Err(err);
        }

        debug!(task_id = %task.id, "Task submitted");
        Ok(task.id)
    }

    /// Stop the agent
    ///
    /// The state goes to `Disconnected` immediately, whatever it was. The
    /// child's stdin is then closed and the child gets the configured grace
    /// period to exit before it is killed. Returns the exit status when the
    /// child was reaped.
    pub async fn stop(&mut self) -> Option<ExitStatus> {
        let notices = {
            let mut gate = self.shared.generation.write();
            *gate += 1;
            self.shared.machine.lock().disconnect()
        };
        for event in &notices {
            self.shared.publish(event);
        }

        let mut process = self.process.take()?;
        drop(process.stdin.take());

        let deadline = Instant::now() + self.agent.shutdown_grace;
        let status = match timeout_at(deadline, process.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(generation = process.generation, error = %e, "Failed to wait for agent");
                None
            }
            Err(_) => {
                warn!(
                    generation = process.generation,
                    "Agent did not exit within grace period, killing"
                );
                if let Err(e) = process.child.kill().await {
                    warn!(generation = process.generation, error = %e, "Failed to kill agent");
                }
                process.child.try_wait().ok().flatten()
            }
        };

        for handle in &mut process.readers {
            if timeout_at(deadline, &mut *handle).await.is_err() {
                handle.abort();
            }
        }

        info!(
            generation = process.generation,
            status = ?status,
            "Agent process stopped"
        );
        status
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.agent.program);
        command
            .args(&self.agent.args)
            .arg(&self.settings.provider)
            .arg(&self.settings.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.agent.working_dir {
            command.current_dir(dir);
        }
        command
    }

    async fn write_shared_config(&self) -> Result<(), SupervisorError> {
        let Some(ref path) = self.agent.shared_config_path else {
            return Ok(());
        };
        let json = self
            .settings
            .to_json()
            .map_err(|e| SupervisorError::SharedConfig {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
        tokio::fs::write(path, json)
            .await
            .map_err(|source| SupervisorError::SharedConfig {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "Wrote shared agent config");
        Ok(())
    }

    async fn write_task(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self
            .process
            .as_mut()
            .and_then(|p| p.stdin.as_mut())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("settings", &self.settings)
            .field("pid", &self.child_pid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::ChannelSink;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn supervisor() -> (Supervisor, mpsc::Receiver<AgentEvent>) {
        let broadcaster = Broadcaster::new();
        let (sink, rx) = ChannelSink::pair(64);
        broadcaster.subscribe(sink);
        let supervisor = Supervisor::new(
            AgentConfig::default(),
            ProtocolConfig::default(),
            broadcaster,
        );
        (supervisor, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_one_error() {
        let (mut supervisor, mut rx) = supervisor();

        let result = supervisor.send("open example.com").await;

        assert!(matches!(
            result,
            Err(SupervisorError::NotReady {
                state: SupervisorState::Disconnected
            })
        ));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        assert!(supervisor.pending_task().is_none());
    }

    #[tokio::test]
    async fn test_send_blank_task_is_rejected() {
        let (mut supervisor, mut rx) = supervisor();
        let result = supervisor.send(" \n\t ").await;
        assert!(matches!(result, Err(SupervisorError::EmptyTask)));
        assert_eq!(
            drain(&mut rx),
            vec![AgentEvent::error("cannot send an empty task")]
        );
    }

    #[tokio::test]
    async fn test_stop_when_disconnected_is_quiet() {
        let (mut supervisor, mut rx) = supervisor();
        assert_eq!(supervisor.stop().await, None);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        assert_eq!(supervisor.generation(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_stays_disconnected() {
        let broadcaster = Broadcaster::new();
        let (sink, mut rx) = ChannelSink::pair(64);
        broadcaster.subscribe(sink);
        let agent = AgentConfig {
            program: "/nonexistent/agent-conductor-test-binary".to_string(),
            args: Vec::new(),
            ..AgentConfig::default()
        };
        let mut supervisor = Supervisor::new(agent, ProtocolConfig::default(), broadcaster);

        let result = supervisor
            .start(AgentSettings::new("google", "gemini"))
            .await;

        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        assert_eq!(supervisor.child_pid(), None);
        assert_eq!(supervisor.settings(), &AgentSettings::new("google", "gemini"));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            SupervisorError::NotReady {
                state: SupervisorState::Starting
            }
            .to_string(),
            "agent is not ready (state: starting)"
        );
        assert_eq!(
            SupervisorError::Busy {
                task_id: TaskId::new("task_1")
            }
            .to_string(),
            "agent is busy with task task_1"
        );
    }
}
