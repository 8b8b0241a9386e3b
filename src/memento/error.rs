use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::git::GitError;

/// The two roles run in every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Implement,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Plan => write!(f, "planner"),
            Phase::Implement => write!(f, "implementer"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MementoError {
    #[error("Iteration {iteration}: planner produced no valid plan ({reason})")]
    NoPlan { iteration: u32, reason: String },

    #[error("Iteration {iteration}: {phase} still failing after {attempts} retries: {message}")]
    RetriesExhausted {
        iteration: u32,
        phase: Phase,
        attempts: u32,
        message: String,
    },

    #[error("Iteration {iteration}: {phase} failed: {message}")]
    PhaseFailed {
        iteration: u32,
        phase: Phase,
        message: String,
    },

    #[error("Iteration {iteration}: {phase} timed out after {after:?}")]
    Timeout {
        iteration: u32,
        phase: Phase,
        after: Duration,
    },

    #[error("Iteration {iteration}: {phase} harness error: {message}")]
    Harness {
        iteration: u32,
        phase: Phase,
        message: String,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}
