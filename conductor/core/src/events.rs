//! Agent Events
//!
//! Events published by the supervisor to every subscribed surface. These are
//! the only way the supervisor talks to the outside world: decoded agent
//! output, classified errors, lifecycle notices and state changes all travel
//! through the same path.
//!
//! # Design Philosophy
//!
//! Surfaces are "dumb" renderers. They don't interpret the agent's text
//! protocol; they receive already-classified events and display them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One unit of supervisor output
///
/// Events are immutable once created. Events derived from the agent's
/// standard output reach every subscriber in stream order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentEvent {
    /// Agent narration (untagged stdout line, or non-error stderr line)
    AgentOutput(String),
    /// Lifecycle or daemon message (`[daemon]`-tagged line, or supervisor notice)
    SystemMessage(String),
    /// Error surfaced to the user (tagged, heuristically detected, or misuse)
    ErrorMessage(String),
    /// The agent finished one submitted task
    TaskDone,
    /// Readiness latched (`true`) or lost (`false`)
    ReadinessChanged(bool),
    /// The supervisor state machine moved to a new state
    StateChanged(SupervisorState),
}

impl AgentEvent {
    /// Build an agent output event
    pub fn output(text: impl Into<String>) -> Self {
        Self::AgentOutput(text.into())
    }

    /// Build a system message event
    pub fn system(text: impl Into<String>) -> Self {
        Self::SystemMessage(text.into())
    }

    /// Build an error event
    pub fn error(text: impl Into<String>) -> Self {
        Self::ErrorMessage(text.into())
    }

    /// The kind of this event, without its payload
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AgentOutput(_) => EventKind::Agent,
            Self::SystemMessage(_) => EventKind::System,
            Self::ErrorMessage(_) => EventKind::Error,
            Self::TaskDone => EventKind::TaskDone,
            Self::ReadinessChanged(_) => EventKind::Readiness,
            Self::StateChanged(_) => EventKind::State,
        }
    }

    /// Text payload, for the variants that carry one
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::AgentOutput(text) | Self::SystemMessage(text) | Self::ErrorMessage(text) => {
                Some(text)
            }
            _ => None,
        }
    }

    /// Whether this is an error event
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorMessage(_))
    }
}

/// Payload-free discriminant of [`AgentEvent`]
///
/// Used by the tag table in the framing decoder to say which kind of text
/// event a prefix produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// [`AgentEvent::AgentOutput`]
    Agent,
    /// [`AgentEvent::SystemMessage`]
    System,
    /// [`AgentEvent::ErrorMessage`]
    Error,
    /// [`AgentEvent::TaskDone`]
    TaskDone,
    /// [`AgentEvent::ReadinessChanged`]
    Readiness,
    /// [`AgentEvent::StateChanged`]
    State,
}

impl EventKind {
    /// Build a text event of this kind
    ///
    /// Non-text kinds fall back to agent output; the tag table only ever
    /// names text kinds.
    pub fn with_text(self, text: impl Into<String>) -> AgentEvent {
        match self {
            Self::System => AgentEvent::SystemMessage(text.into()),
            Self::Error => AgentEvent::ErrorMessage(text.into()),
            _ => AgentEvent::AgentOutput(text.into()),
        }
    }
}

/// Supervisor state machine states
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// No agent process (initial and terminal state)
    #[default]
    Disconnected,
    /// Process spawned, waiting for the readiness sentinel
    Starting,
    /// Idle and accepting one task
    Ready,
    /// A task is in flight
    Running,
}

impl SupervisorState {
    /// Wire name, as used by the remote `status` envelope
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
        }
    }

    /// Human-readable description
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Disconnected => "Agent stopped",
            Self::Starting => "Starting agent...",
            Self::Ready => "Ready",
            Self::Running => "Working...",
        }
    }

    /// Whether an agent process is attached in this state
    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_roundtrip_for_text_kinds() {
        assert_eq!(
            EventKind::Error.with_text("boom"),
            AgentEvent::ErrorMessage("boom".to_string())
        );
        assert_eq!(
            EventKind::System.with_text("restarting"),
            AgentEvent::SystemMessage("restarting".to_string())
        );
        assert_eq!(EventKind::Error.with_text("x").kind(), EventKind::Error);
    }

    #[test]
    fn test_text_payload() {
        assert_eq!(AgentEvent::output("hi").text(), Some("hi"));
        assert_eq!(AgentEvent::TaskDone.text(), None);
        assert!(AgentEvent::error("x").is_error());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SupervisorState::default(), SupervisorState::Disconnected);
        assert_eq!(SupervisorState::Running.to_string(), "running");
        assert!(!SupervisorState::Disconnected.is_live());
        assert!(SupervisorState::Starting.is_live());
    }
}
