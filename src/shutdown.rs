//! Lifecycle state machine for the scheduling service.
//!
//! The service moves strictly forward through
//! `Running -> ShuttingDown -> Terminated`. Only the owner's disposal call
//! starts the shutdown, and only the dispatcher marks termination once the
//! delay queue and backend pool have both drained.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

/// Lifecycle state of a scheduling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Result of a bounded disposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout {
        pending_delayed: usize,
        active_workers: usize,
    },
}

/// Shared lifecycle cell with blocking wait for termination.
pub(crate) struct Lifecycle {
    state: Mutex<LifecycleState>,
    changed: Condvar,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Running),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Move `Running -> ShuttingDown`. Returns false if already past `Running`.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if *state != LifecycleState::Running {
            return false;
        }
        *state = LifecycleState::ShuttingDown;
        self.changed.notify_all();
        true
    }

    /// Move `ShuttingDown -> Terminated` and wake every waiter.
    pub fn mark_terminated(&self) {
        let mut state = self.state.lock();
        debug_assert_ne!(*state, LifecycleState::Running, "terminated without shutdown");
        *state = LifecycleState::Terminated;
        self.changed.notify_all();
    }

    /// Block until terminated or until `timeout` elapses.
    pub fn await_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while *state != LifecycleState::Terminated {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return *state == LifecycleState::Terminated;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }
}
