//! Task State Machine
//!
//! Tasks move forward only. The state is persisted in the contract document
//! and every `mark-task-*` invocation re-validates the requested move against
//! what is on disk, so two workers can never drag a finished task back into
//! RUNNING.
//!
//! # State Flow
//!
//! ```text
//! Pending
//!     ↓
//! Running
//!     ↓
//! Succeeded | Failed
//!
//! (Pending and Running can both transition to Failed)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle states of a task, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum TaskState {
    /// Declared but not started
    #[default]
    Pending = 0,

    /// A worker reported that it started
    Running = 1,

    /// Finished successfully (terminal state)
    Succeeded = 2,

    /// Finished with an error (terminal state)
    Failed = 3,
}

impl TaskState {
    /// Returns the numeric order of this state
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true if this is a terminal state (Succeeded or Failed)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Upper-case name as written to the contract and printed by the CLI
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Returns all states in order
    pub const fn all_states() -> &'static [Self] {
        &[Self::Pending, Self::Running, Self::Succeeded, Self::Failed]
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during task state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskTransitionError {
    /// Attempted to leave a terminal state
    #[error("Cannot move task from terminal state {from} to {to}")]
    FromTerminalState { from: TaskState, to: TaskState },

    /// Attempted to go backwards (not allowed)
    #[error("Cannot go backwards from {from} to {to} (tasks are forward-only)")]
    BackwardTransition { from: TaskState, to: TaskState },
}

/// The effect of a validated transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Target equals the current state; nothing to write
    Unchanged,
    /// States entered, in order. `Pending → Succeeded` enters Running first.
    Entered(Vec<TaskState>),
}

/// Validate a move from `from` to `to`.
///
/// # Errors
///
/// - `FromTerminalState` if `from` is terminal and `to` differs from it
/// - `BackwardTransition` if `to` orders before `from`
pub fn plan_transition(from: TaskState, to: TaskState) -> Result<Transition, TaskTransitionError> {
    if from == to {
        return Ok(Transition::Unchanged);
    }

    if from.is_terminal() {
        return Err(TaskTransitionError::FromTerminalState { from, to });
    }

    if to.order() < from.order() {
        return Err(TaskTransitionError::BackwardTransition { from, to });
    }

    let entered = match (from, to) {
        (TaskState::Pending, TaskState::Succeeded) => vec![TaskState::Running, TaskState::Succeeded],
        (_, target) => vec![target],
    };

    Ok(Transition::Entered(entered))
}

// Convert TaskTransitionError to the main ContractError type
impl From<TaskTransitionError> for crate::error::ContractError {
    fn from(err: TaskTransitionError) -> Self {
        crate::error::ContractError::InvalidTransition(err.to_string())
    }
}
