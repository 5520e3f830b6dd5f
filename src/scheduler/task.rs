//! Task records: one unit of work plus its scheduling and cancellation state.
//!
//! A record is shared between the caller's handle, the delay queue and the
//! backend pool. Every state change happens under the record's own lock,
//! which is what makes cancellation atomic with respect to dispatch: a worker
//! only starts a body after moving the record from `Pending` to `Running`.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{TaskError, TaskFailure};
use crate::telemetry;

/// Upper bound applied to every delay and period.
pub(crate) const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Ordering key inside the delay queue: trigger time, then sequence number.
pub(crate) type TaskKey = (Instant, u64);

/// Lifecycle of a single task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Cancelled,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Done | Self::Failed)
    }
}

/// Repetition policy of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    /// Next trigger = previous trigger + period.
    FixedRate(Duration),
    /// Next trigger = completion time + period.
    FixedDelay(Duration),
}

impl Repeat {
    pub fn is_periodic(self) -> bool {
        !matches!(self, Self::Once)
    }

    fn next_trigger(self, previous: Instant, completed: Instant) -> Instant {
        match self {
            Self::Once => previous,
            Self::FixedRate(period) => deadline_after(previous, period),
            Self::FixedDelay(period) => deadline_after(completed, period),
        }
    }
}

/// `base + delay`, clamped so it never overflows the clock.
pub(crate) fn deadline_after(base: Instant, delay: Duration) -> Instant {
    let mut delay = delay.min(MAX_DELAY);
    loop {
        if let Some(deadline) = base.checked_add(delay) {
            return deadline;
        }
        delay /= 2;
    }
}

thread_local! {
    static CURRENT_INTERRUPT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// Returns true if the task running on the current thread was cancelled
/// with `may_interrupt_if_running = true`.
///
/// Task bodies poll this at safe points to stop early. Always false outside
/// a task body.
pub fn interrupted() -> bool {
    CURRENT_INTERRUPT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    })
}

struct InterruptScope;

impl InterruptScope {
    fn enter(flag: &Arc<AtomicBool>) -> Self {
        CURRENT_INTERRUPT.with(|current| *current.borrow_mut() = Some(Arc::clone(flag)));
        Self
    }
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        CURRENT_INTERRUPT.with(|current| *current.borrow_mut() = None);
    }
}

/// What the worker must do with a record after running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Finished,
    Reschedule,
}

/// Type-erased view of a task record used by the queue, pool and pump.
pub(crate) trait Job: Send + Sync {
    fn id(&self) -> u64;
    fn key(&self) -> TaskKey;
    fn state(&self) -> TaskState;
    fn is_periodic(&self) -> bool;

    /// Execute the body on the current (worker) thread.
    fn run(&self) -> RunOutcome;

    /// `Pending -> Cancelled` because the service is draining.
    fn cancel_for_shutdown(&self) -> bool;

    /// `Pending -> Failed` because the record could not reach the pool.
    fn reject(&self, reason: String);

    /// Move the trigger of a pending record (transfer retry backoff).
    fn postpone(&self, trigger: Instant);

    fn note_transfer_failure(&self) -> u32;
    fn transfer_failures(&self) -> u32;

    fn describe(&self) -> String;
}

enum Body<T> {
    Once(Option<Box<dyn FnOnce() -> T + Send>>),
    Repeating(Box<dyn FnMut() -> T + Send>),
}

impl<T> Body<T> {
    fn call(&mut self) -> Option<T> {
        match self {
            Self::Once(f) => f.take().map(|f| f()),
            Self::Repeating(f) => Some(f()),
        }
    }
}

struct CellState<T> {
    state: TaskState,
    trigger: Instant,
    outcome: Option<Result<T, TaskError>>,
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cancel {
    pub cancelled: bool,
    /// Delay-queue key to remove, set when the record was still pending.
    pub queued_key: Option<TaskKey>,
}

pub(crate) struct TaskCell<T> {
    id: u64,
    repeat: Repeat,
    body: Mutex<Body<T>>,
    inner: Mutex<CellState<T>>,
    finished: Condvar,
    interrupt: Arc<AtomicBool>,
    transfer_failures: AtomicU32,
}

impl<T: Send + 'static> TaskCell<T> {
    pub fn once<F>(id: u64, trigger: Instant, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::with_body(id, trigger, Repeat::Once, Body::Once(Some(Box::new(f))))
    }

    fn with_body(id: u64, trigger: Instant, repeat: Repeat, body: Body<T>) -> Self {
        Self {
            id,
            repeat,
            body: Mutex::new(body),
            inner: Mutex::new(CellState {
                state: TaskState::Pending,
                trigger,
                outcome: None,
            }),
            finished: Condvar::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            transfer_failures: AtomicU32::new(0),
        }
    }

    pub fn repeat(&self) -> Repeat {
        self.repeat
    }

    pub fn trigger(&self) -> Instant {
        self.inner.lock().trigger
    }

    pub fn cancel(&self, may_interrupt_if_running: bool) -> Cancel {
        let mut st = self.inner.lock();
        let state = st.state;
        match state {
            TaskState::Pending => {
                let key = (st.trigger, self.id);
                self.finish(&mut st, TaskState::Cancelled, Err(TaskError::Cancelled));
                Cancel {
                    cancelled: true,
                    queued_key: Some(key),
                }
            }
            // A running periodic task finishes its current run but is never rescheduled.
            TaskState::Running if may_interrupt_if_running || self.repeat.is_periodic() => {
                if may_interrupt_if_running {
                    self.interrupt.store(true, Ordering::Release);
                }
                self.finish(&mut st, TaskState::Cancelled, Err(TaskError::Cancelled));
                Cancel {
                    cancelled: true,
                    queued_key: None,
                }
            }
            _ => Cancel {
                cancelled: false,
                queued_key: None,
            },
        }
    }

    /// Block until the record is terminal. Returns false if `deadline` passed first.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut st = self.inner.lock();
        while !st.state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.finished.wait_until(&mut st, deadline).timed_out() {
                        return st.state.is_terminal();
                    }
                }
                None => self.finished.wait(&mut st),
            }
        }
        true
    }

    pub fn take_outcome(&self) -> Option<Result<T, TaskError>> {
        self.inner.lock().outcome.take()
    }

    fn finish(&self, st: &mut CellState<T>, state: TaskState, outcome: Result<T, TaskError>) {
        st.state = state;
        st.outcome = Some(outcome);
        self.finished.notify_all();
    }

    fn complete(&self, result: std::thread::Result<Option<T>>) -> RunOutcome {
        let mut st = self.inner.lock();
        if st.state != TaskState::Running {
            // Cancelled while running; the Cancelled outcome stands.
            return RunOutcome::Finished;
        }
        match result {
            Ok(Some(_)) if self.repeat.is_periodic() => {
                st.trigger = self.repeat.next_trigger(st.trigger, Instant::now());
                st.state = TaskState::Pending;
                return RunOutcome::Reschedule;
            }
            Ok(Some(value)) => {
                self.finish(&mut st, TaskState::Done, Ok(value));
                telemetry::record_task_finished("done");
            }
            Ok(None) => {
                let err = TaskError::Rejected("task body already consumed".to_string());
                self.finish(&mut st, TaskState::Failed, Err(err));
                telemetry::record_task_finished("failed");
            }
            Err(payload) => {
                let failure = TaskFailure::from_panic(payload);
                tracing::debug!(task = self.id, error = %failure, "task body panicked");
                self.finish(&mut st, TaskState::Failed, Err(TaskError::Failed(failure)));
                telemetry::record_task_finished("failed");
            }
        }
        RunOutcome::Finished
    }
}

impl TaskCell<()> {
    pub fn repeating<F>(id: u64, trigger: Instant, repeat: Repeat, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::with_body(id, trigger, repeat, Body::Repeating(Box::new(f)))
    }
}

impl<T: Send + 'static> Job for TaskCell<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn key(&self) -> TaskKey {
        (self.inner.lock().trigger, self.id)
    }

    fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    fn is_periodic(&self) -> bool {
        self.repeat.is_periodic()
    }

    fn run(&self) -> RunOutcome {
        let trigger = {
            let mut st = self.inner.lock();
            if st.state != TaskState::Pending {
                return RunOutcome::Finished;
            }
            st.state = TaskState::Running;
            st.trigger
        };

        let started = Instant::now();
        telemetry::record_dispatch_lag(started.saturating_duration_since(trigger));

        let result = {
            let _scope = InterruptScope::enter(&self.interrupt);
            let mut body = self.body.lock();
            panic::catch_unwind(AssertUnwindSafe(|| body.call()))
        };
        telemetry::record_execution_time(started.elapsed());

        self.complete(result)
    }

    fn cancel_for_shutdown(&self) -> bool {
        let mut st = self.inner.lock();
        if st.state != TaskState::Pending {
            return false;
        }
        self.finish(&mut st, TaskState::Cancelled, Err(TaskError::Cancelled));
        telemetry::record_task_cancelled();
        true
    }

    fn reject(&self, reason: String) {
        let mut st = self.inner.lock();
        if st.state == TaskState::Pending {
            self.finish(&mut st, TaskState::Failed, Err(TaskError::Rejected(reason)));
            telemetry::record_task_finished("rejected");
        }
    }

    fn postpone(&self, trigger: Instant) {
        let mut st = self.inner.lock();
        if st.state == TaskState::Pending {
            st.trigger = trigger;
        }
    }

    fn note_transfer_failure(&self) -> u32 {
        self.transfer_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn transfer_failures(&self) -> u32 {
        self.transfer_failures.load(Ordering::Acquire)
    }

    fn describe(&self) -> String {
        let st = self.inner.lock();
        let due_in = st.trigger.saturating_duration_since(Instant::now());
        format!(
            "task#{} state={:?} repeat={:?} due_in={:?} transfer_failures={}",
            self.id,
            st.state,
            self.repeat,
            due_in,
            self.transfer_failures(),
        )
    }
}
