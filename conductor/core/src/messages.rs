//! Remote Protocol Envelopes
//!
//! JSON text frames exchanged with remote (WebSocket) surfaces. Every frame
//! is an object with a `type` discriminator.
//!
//! ```text
//! surface -> conductor   {"type":"task","text":"open example.com"}
//!                        {"type":"start_daemon","provider":"google","model":"gemini-2.5-flash"}
//!                        {"type":"stop_daemon"}
//!
//! conductor -> surface   {"type":"status","status":"ready"}
//!                        {"type":"output","text":"...","source":"agent"}
//!                        {"type":"error","text":"..."}
//!                        {"type":"done"}
//! ```
//!
//! The outbound side is not a separate protocol: [`RemoteSink`] is just the
//! broadcaster sink that renders [`AgentEvent`]s into these frames.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::broadcaster::{EventSink, SinkError};
use crate::events::{AgentEvent, SupervisorState};

/// Frames sent by a remote surface
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a task to the agent
    Task {
        /// Task text
        text: String,
    },
    /// Start (or restart with new settings) the agent process
    StartDaemon {
        /// Provider identifier (configured default when absent)
        #[serde(default)]
        provider: Option<String>,
        /// Model identifier (configured default when absent)
        #[serde(default)]
        model: Option<String>,
    },
    /// Stop the agent process
    StopDaemon,
}

impl ClientMessage {
    /// Parse one inbound text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Origin of an `output` frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    /// Agent narration
    Agent,
    /// Daemon or supervisor notice
    System,
}

/// Frames sent to a remote surface
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Supervisor state
    Status {
        /// One of the four state names
        status: SupervisorState,
    },
    /// Agent or system text
    Output {
        /// Text to display
        text: String,
        /// Where it came from
        source: OutputSource,
    },
    /// Error text
    Error {
        /// Text to display
        text: String,
    },
    /// The in-flight task finished
    Done,
}

impl ServerMessage {
    /// Render an event as a frame
    ///
    /// Readiness changes have no frame of their own; they are visible
    /// through the `status` frame that accompanies them.
    #[must_use]
    pub fn from_event(event: &AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::AgentOutput(text) => Some(Self::Output {
                text: text.clone(),
                source: OutputSource::Agent,
            }),
            AgentEvent::SystemMessage(text) => Some(Self::Output {
                text: text.clone(),
                source: OutputSource::System,
            }),
            AgentEvent::ErrorMessage(text) => Some(Self::Error { text: text.clone() }),
            AgentEvent::TaskDone => Some(Self::Done),
            AgentEvent::StateChanged(state) => Some(Self::Status { status: *state }),
            AgentEvent::ReadinessChanged(_) => None,
        }
    }

    /// Error frame for a single client
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Broadcaster sink for a remote connection
///
/// Renders events into JSON frames and queues them for the connection's
/// writer task. A closed queue means the connection is gone.
#[derive(Debug, Clone)]
pub struct RemoteSink {
    tx: mpsc::Sender<String>,
}

impl RemoteSink {
    /// Wrap the outbound frame queue of one connection
    #[must_use]
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

impl EventSink for RemoteSink {
    fn deliver(&self, event: &AgentEvent) -> Result<(), SinkError> {
        if self.tx.is_closed() {
            return Err(SinkError::Disconnected);
        }
        let Some(frame) = ServerMessage::from_event(event) else {
            return Ok(());
        };
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode event frame");
                return Ok(());
            }
        };
        self.tx.try_send(json).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Disconnected,
        })
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
