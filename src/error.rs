//! Error types for the scheduling service.
//!
//! Service-level failures (`SchedulerError`) are returned to the caller that
//! attempted the operation. Task-level failures (`TaskError`) are captured
//! per task and only ever surface through that task's handle.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::shutdown::LifecycleState;

/// Errors raised by the scheduling service itself.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Submission rejected: scheduler '{scheduler}' is {state}")]
    Rejected {
        scheduler: String,
        state: LifecycleState,
    },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to spawn {role} thread: {reason}")]
    ThreadSpawn { role: &'static str, reason: String },
}

impl SchedulerError {
    /// Returns true if the error was caused by the service no longer accepting work.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Errors surfaced through a task handle.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task failed: {0}")]
    Failed(TaskFailure),

    #[error("Timed out after {0:?} waiting for task outcome")]
    Timeout(Duration),

    #[error("Task rejected by backend pool: {0}")]
    Rejected(String),

    #[error("Task outcome was already taken")]
    OutcomeTaken,
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The captured failure, if the task body panicked.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A panic captured while running a task body.
///
/// The original payload is kept so callers can downcast it or resume the
/// unwind on their own thread.
pub struct TaskFailure {
    message: String,
    payload: Box<dyn Any + Send>,
}

impl TaskFailure {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message, payload }
    }

    /// Human-readable panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Downcast the panic payload to a concrete type.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }

    /// Take ownership of the original panic payload.
    pub fn into_panic(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Re-raise the captured panic on the current thread.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFailure")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.message)
    }
}
