//! Caller-facing handle to a scheduled or submitted task.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::delay_queue::DelayQueue;
use super::task::{Job, TaskCell, TaskState};
use crate::error::TaskError;
use crate::telemetry;

/// Handle to a task owned by a scheduler.
///
/// Dropping the handle does not cancel the task. The outcome can only be
/// taken once: `get` consumes the handle, while `get_timeout` borrows it so
/// a timed-out wait can be retried.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
    queue: Arc<DelayQueue>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new(cell: Arc<TaskCell<T>>, queue: Arc<DelayQueue>) -> Self {
        Self { cell, queue }
    }

    /// Scheduler-unique task id.
    pub fn id(&self) -> u64 {
        self.cell.id()
    }

    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// True once the task is done, failed or cancelled.
    pub fn is_done(&self) -> bool {
        self.cell.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.state() == TaskState::Cancelled
    }

    pub fn is_periodic(&self) -> bool {
        self.cell.repeat().is_periodic()
    }

    /// Time left until the next trigger; zero once due or finished.
    pub fn delay(&self) -> Duration {
        if self.is_done() {
            return Duration::ZERO;
        }
        self.cell.trigger().saturating_duration_since(Instant::now())
    }

    /// Attempt to cancel the task. Never blocks.
    ///
    /// A pending task is cancelled and leaves the delay queue. A running
    /// one-shot task is cancelled only if `may_interrupt_if_running`, in
    /// which case [`interrupted`](crate::interrupted) turns true for its
    /// body. A running periodic task always accepts cancellation and is not
    /// rescheduled. Returns false if the task had already finished.
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        let outcome = self.cell.cancel(may_interrupt_if_running);
        if let Some(key) = outcome.queued_key {
            self.queue.remove(key);
        }
        if outcome.cancelled {
            telemetry::record_task_cancelled();
            tracing::debug!(task = self.id(), may_interrupt_if_running, "task cancelled");
        }
        outcome.cancelled
    }

    /// Block until the task is terminal without taking its outcome.
    pub fn wait(&self) {
        self.cell.wait(None);
    }

    /// Like [`wait`](Self::wait) with a bound. Returns true if terminal.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait(Instant::now().checked_add(timeout))
    }

    /// Block until terminal and return the outcome.
    pub fn get(self) -> Result<T, TaskError> {
        self.cell.wait(None);
        self.take()
    }

    /// Like [`get`](Self::get), failing with [`TaskError::Timeout`] if the
    /// task is not terminal within `timeout`.
    ///
    /// A timeout leaves the outcome in place. Once an outcome has been
    /// returned, later calls fail with [`TaskError::OutcomeTaken`].
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        if !self.wait_timeout(timeout) {
            return Err(TaskError::Timeout(timeout));
        }
        self.take()
    }

    fn take(&self) -> Result<T, TaskError> {
        self.cell.take_outcome().unwrap_or(Err(TaskError::OutcomeTaken))
    }
}

impl<T> fmt::Debug for TaskHandle<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id())
            .field("state", &self.cell.state())
            .field("repeat", &self.cell.repeat())
            .finish()
    }
}
