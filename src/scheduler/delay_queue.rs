//! Time-ordered holding area for tasks that are not yet due.
//!
//! Entries are keyed by `(trigger, sequence)` so equal trigger times pop in
//! submission order and cancellation can remove an entry in O(log n).
//! The dispatcher is the only consumer; the queue also tracks whether a
//! consumer is alive so producers know when the pump must be (re)started.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::task::{Job, TaskKey, TaskState};
use crate::telemetry;

/// The queue no longer accepts new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueClosed;

/// Result of a successful offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Offered {
    /// No consumer is running; the caller must start one.
    pub needs_consumer: bool,
}

/// Result of a blocking take.
pub(crate) enum Take {
    /// The head entry. `early` is set when it was released before its
    /// trigger because the queue is closed and draining.
    Ready { job: Arc<dyn Job>, early: bool },
    /// Empty for the whole idle period; the consumer should exit.
    Idle,
    /// Closed and fully drained.
    Closed,
}

struct QueueState {
    entries: BTreeMap<TaskKey, Arc<dyn Job>>,
    closed: bool,
    consumer_active: bool,
}

pub(crate) struct DelayQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                closed: false,
                consumer_active: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Insert a pending record. Records cancelled before insertion are dropped.
    pub fn offer(&self, job: Arc<dyn Job>) -> Result<Offered, QueueClosed> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(QueueClosed);
        }
        if job.state() == TaskState::Pending {
            st.entries.insert(job.key(), job);
            telemetry::record_delay_queue_depth(st.entries.len());
            self.available.notify_one();
        }
        let needs_consumer = !st.consumer_active;
        st.consumer_active = true;
        Ok(Offered { needs_consumer })
    }

    /// Re-insert a record whose transfer to the pool failed.
    ///
    /// Only the consumer calls this, so it is allowed while draining.
    pub fn offer_retry(&self, job: Arc<dyn Job>) {
        let mut st = self.state.lock();
        if job.state() == TaskState::Pending {
            st.entries.insert(job.key(), job);
            self.available.notify_one();
        }
    }

    /// Remove a cancelled entry. Returns false if it was already popped.
    pub fn remove(&self, key: TaskKey) -> bool {
        let mut st = self.state.lock();
        let removed = st.entries.remove(&key).is_some();
        if removed {
            telemetry::record_delay_queue_depth(st.entries.len());
            // The consumer may be sleeping until the removed head's deadline.
            self.available.notify_one();
        }
        removed
    }

    /// Block until the head entry is due, then remove and return it.
    ///
    /// Waits on the head's actual deadline rather than polling. Once closed,
    /// entries are released immediately regardless of their trigger.
    pub fn take_ready(&self, idle_timeout: Duration) -> Take {
        let mut st = self.state.lock();
        loop {
            let now = Instant::now();
            let closed = st.closed;
            let head = st.entries.first_key_value().map(|((trigger, _), _)| *trigger);
            if let Some(trigger) = head {
                if trigger <= now || closed {
                    if let Some((_, job)) = st.entries.pop_first() {
                        telemetry::record_delay_queue_depth(st.entries.len());
                        return Take::Ready {
                            job,
                            early: trigger > now,
                        };
                    }
                }
                self.available.wait_until(&mut st, trigger);
                continue;
            }

            if closed {
                st.consumer_active = false;
                return Take::Closed;
            }

            let timed_out = self.available.wait_for(&mut st, idle_timeout).timed_out();
            if timed_out && st.entries.is_empty() && !st.closed {
                st.consumer_active = false;
                return Take::Idle;
            }
        }
    }

    /// Time until the head becomes due, or `None` when empty.
    pub fn peek_delay(&self) -> Option<Duration> {
        let st = self.state.lock();
        st.entries
            .keys()
            .next()
            .map(|(trigger, _)| trigger.saturating_duration_since(Instant::now()))
    }

    /// Stop accepting offers and release everything to the consumer.
    ///
    /// Returns true if no consumer is running and one must be started to drain.
    pub fn close(&self) -> bool {
        let mut st = self.state.lock();
        st.closed = true;
        self.available.notify_all();
        let needs_consumer = !st.consumer_active;
        st.consumer_active = true;
        needs_consumer
    }

    /// Undo a consumer reservation after the consumer failed to start.
    pub fn consumer_failed(&self) {
        self.state.lock().consumer_active = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Diagnostic descriptions of every queued record, head first.
    pub fn describe_entries(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .values()
            .map(|job| job.describe())
            .collect()
    }
}

#[cfg(test)]
#[path = "delay_queue_tests.rs"]
mod tests;
