//! Task lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Submitted -> Working -> Completed
///                 |  ^
///                 v  |
///            InputRequired
///
/// Submitted | Working | InputRequired -> Failed
/// Submitted | Working | InputRequired -> Canceled
/// ```
///
/// Serialized with the A2A wire names (`input-required`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Created by the caller, not yet picked up by the executor
    Submitted,
    /// An execution is in progress
    Working,
    /// Execution suspended until a resume signal arrives
    InputRequired,
    /// The model produced a final answer
    Completed,
    /// Unrecoverable error, recorded on the task
    Failed,
    /// Cancelled by the caller or by the execution context
    Canceled,
}

impl TaskState {
    /// All states, in declaration order.
    pub const ALL: [TaskState; 6] = [
        TaskState::Submitted,
        TaskState::Working,
        TaskState::InputRequired,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Canceled,
    ];

    /// Check if the task is in a terminal state.
    ///
    /// # Property
    /// `is_terminal() => !can_transition_to(x)` for every `x`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Submitted, Working) => true,
            (Working, InputRequired) => true,
            (InputRequired, Working) => true,
            (Working, Completed) => true,
            (Submitted | Working | InputRequired, Failed | Canceled) => true,
            _ => false,
        }
    }

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted a transition that is not an edge of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid task state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}
