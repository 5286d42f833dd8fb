//! Task Types
//!
//! The agent works on one task at a time. A task is a single line of text
//! written to the agent's stdin; it is "pending" from the moment it is
//! accepted until the agent prints the completion marker.
//! The supervisor owns the pending task; surfaces only see events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The single in-flight task descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    /// Unique task identifier
    pub id: TaskId,
    /// Task text exactly as written to the agent (without the newline)
    pub text: String,
    /// When the task was accepted
    pub submitted_at: DateTime<Utc>,
}

impl PendingTask {
    /// Create a pending task for already-normalized text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            text: text.into(),
            submitted_at: Utc::now(),
        }
    }

    /// Milliseconds since the task was accepted
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.submitted_at).num_milliseconds()
    }
}

/// Normalize task text for the agent's one-task-per-line protocol
///
/// Embedded line breaks are flattened to single spaces and the result is
/// trimmed. Returns `None` when nothing is left: the agent silently skips
/// blank lines and would never print a completion marker for them.
#[must_use]
pub fn normalize_task_text(text: &str) -> Option<String> {
    let flattened = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if flattened.is_empty() {
        None
    } else {
        Some(flattened)
    }
}
