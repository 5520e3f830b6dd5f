//! Service facade.
//!
//! A scheduling service has exactly one [`SchedulerOwner`], which holds the
//! privileged maintenance operations (disposal, resizing, thread factory).
//! Everyone else receives an [`AppScheduler`] clone, which can schedule
//! work and observe the service but can never shut it down or reconfigure
//! its backend pool.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ServiceConfig;
use crate::error::{SchedulerError, TaskError};
use crate::scheduler::{
    deadline_after, DelayQueue, Dispatcher, Repeat, TaskCell, TaskHandle, ThreadFactory,
};
use crate::shutdown::{Lifecycle, LifecycleState, ShutdownResult};
use crate::telemetry;

/// Point-in-time statistics of a scheduling service.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub name: String,
    pub state: LifecycleState,
    pub core_pool_size: usize,
    pub current_pool_size: usize,
    pub largest_pool_size: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    /// Ready tasks waiting for a free worker.
    pub queued_in_pool: usize,
    /// Tasks waiting in the delay queue for their trigger.
    pub pending_delayed: usize,
    pub completed_tasks: u64,
    pub dispatcher_starts: u64,
}

struct ServiceInner {
    name: String,
    lifecycle: Arc<Lifecycle>,
    queue: Arc<DelayQueue>,
    dispatcher: Arc<Dispatcher>,
    next_id: AtomicU64,
}

impl ServiceInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        if self.lifecycle.is_accepting() {
            return Ok(());
        }
        Err(SchedulerError::Rejected {
            scheduler: self.name.clone(),
            state: self.lifecycle.state(),
        })
    }

    fn enqueue<T: Send + 'static>(
        &self,
        cell: TaskCell<T>,
        kind: &'static str,
    ) -> Result<TaskHandle<T>, SchedulerError> {
        self.ensure_accepting()?;
        let cell = Arc::new(cell);
        self.dispatcher.schedule(cell.clone())?;
        telemetry::record_task_submitted(kind);
        let handle = TaskHandle::new(cell, Arc::clone(&self.queue));
        tracing::trace!(scheduler = %self.name, task = handle.id(), kind, "task scheduled");
        Ok(handle)
    }

    fn policy_violation(&self, operation: &str) -> SchedulerError {
        tracing::warn!(scheduler = %self.name, operation, "refused maintenance call on shared scheduler");
        SchedulerError::PolicyViolation(format!(
            "{operation} is not allowed on the shared scheduler '{}'; only its owner may do this",
            self.name
        ))
    }

    fn stats(&self) -> SchedulerStats {
        let pool = self.dispatcher.pool().snapshot();
        SchedulerStats {
            name: self.name.clone(),
            state: self.lifecycle.state(),
            core_pool_size: pool.core_pool_size,
            current_pool_size: pool.current_pool_size,
            largest_pool_size: pool.largest_pool_size,
            active_workers: pool.active,
            idle_workers: pool.idle,
            queued_in_pool: pool.queued,
            pending_delayed: self.queue.len(),
            completed_tasks: pool.completed,
            dispatcher_starts: self.dispatcher.pump_starts(),
        }
    }

    fn dispose(&self) -> bool {
        if !self.lifecycle.begin_shutdown() {
            return false;
        }
        tracing::info!(
            scheduler = %self.name,
            pending_delayed = self.queue.len(),
            "scheduler shutting down"
        );
        self.dispatcher.begin_drain();
        true
    }
}

/// Restricted, cloneable handle to a scheduling service.
#[derive(Clone)]
pub struct AppScheduler {
    inner: Arc<ServiceInner>,
}

impl AppScheduler {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `f` as soon as a worker is free.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let inner = &self.inner;
        inner.ensure_accepting()?;
        let cell = Arc::new(TaskCell::once(inner.next_id(), Instant::now(), f));
        inner.dispatcher.execute_now(cell.clone())?;
        telemetry::record_task_submitted("immediate");
        Ok(TaskHandle::new(cell, Arc::clone(&inner.queue)))
    }

    /// Run `f` once after `delay`.
    pub fn schedule<T, F>(&self, f: F, delay: Duration) -> Result<TaskHandle<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let trigger = deadline_after(Instant::now(), delay);
        let cell = TaskCell::once(self.inner.next_id(), trigger, f);
        self.inner.enqueue(cell, "delayed")
    }

    /// Run `f` every `period`, measured from the previous trigger time.
    ///
    /// Overdue runs fire back to back. A panic in `f` stops the repetition.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_repeating(f, initial_delay, Repeat::FixedRate(period), "fixed_rate")
    }

    /// Run `f` repeatedly with `period` between one completion and the next start.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_repeating(f, initial_delay, Repeat::FixedDelay(period), "fixed_delay")
    }

    fn schedule_repeating<F>(
        &self,
        f: F,
        initial_delay: Duration,
        repeat: Repeat,
        kind: &'static str,
    ) -> Result<TaskHandle<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        if let Repeat::FixedRate(period) | Repeat::FixedDelay(period) = repeat {
            if period.is_zero() {
                return Err(SchedulerError::InvalidArgument(
                    "period must be greater than zero".to_string(),
                ));
            }
        }
        let trigger = deadline_after(Instant::now(), initial_delay);
        let cell = TaskCell::repeating(self.inner.next_id(), trigger, repeat, f);
        self.inner.enqueue(cell, kind)
    }

    /// Submit every body and block until all are terminal.
    ///
    /// Outcomes are returned in submission order. If a submission is
    /// rejected, the bodies already submitted are cancelled.
    pub fn invoke_all<T, F, I>(&self, tasks: I) -> Result<Vec<Result<T, TaskError>>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        let mut handles = Vec::new();
        for f in tasks {
            match self.submit(f) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in &handles {
                        handle.cancel(false);
                    }
                    return Err(err);
                }
            }
        }
        Ok(handles.into_iter().map(TaskHandle::get).collect())
    }

    /// Always fails: the shared scheduler can only be disposed by its owner.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        Err(self.inner.policy_violation("shutdown"))
    }

    /// Always fails: the shared scheduler can only be disposed by its owner.
    pub fn shutdown_now(&self) -> Result<(), SchedulerError> {
        Err(self.inner.policy_violation("shutdown_now"))
    }

    pub fn is_shutdown(&self) -> bool {
        !self.inner.lifecycle.is_accepting()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lifecycle.state() == LifecycleState::Terminated
    }

    /// Block until terminated. Returns false if `timeout` elapsed first.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.lifecycle.await_terminated(timeout)
    }

    pub fn core_pool_size(&self) -> usize {
        self.inner.dispatcher.pool().core_pool_size()
    }

    pub fn current_pool_size(&self) -> usize {
        self.inner.dispatcher.pool().current_pool_size()
    }

    /// Read-only view of the backend pool.
    pub fn backend_pool(&self) -> BackendPoolView {
        BackendPoolView {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats()
    }
}

impl fmt::Debug for AppScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppScheduler")
            .field("name", &self.inner.name)
            .field("state", &self.inner.lifecycle.state())
            .finish()
    }
}

/// Backend pool as seen by ordinary callers. Mutations are refused.
#[derive(Clone)]
pub struct BackendPoolView {
    inner: Arc<ServiceInner>,
}

impl BackendPoolView {
    pub fn core_pool_size(&self) -> usize {
        self.inner.dispatcher.pool().core_pool_size()
    }

    pub fn current_pool_size(&self) -> usize {
        self.inner.dispatcher.pool().current_pool_size()
    }

    pub fn largest_pool_size(&self) -> usize {
        self.inner.dispatcher.pool().snapshot().largest_pool_size
    }

    pub fn active_count(&self) -> usize {
        self.inner.dispatcher.pool().snapshot().active
    }

    pub fn completed_task_count(&self) -> u64 {
        self.inner.dispatcher.pool().snapshot().completed
    }

    pub fn set_core_pool_size(&self, _size: usize) -> Result<(), SchedulerError> {
        Err(self.inner.policy_violation("set_core_pool_size"))
    }

    pub fn set_thread_factory(&self, _factory: Arc<dyn ThreadFactory>) -> Result<(), SchedulerError> {
        Err(self.inner.policy_violation("set_thread_factory"))
    }

    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        Err(self.inner.policy_violation("backend pool shutdown"))
    }
}

/// Privileged owner of a scheduling service.
///
/// Dropping the owner disposes the service without waiting for it to drain.
pub struct SchedulerOwner {
    scheduler: AppScheduler,
}

impl SchedulerOwner {
    pub fn new(name: impl Into<String>, config: ServiceConfig) -> Self {
        let name = name.into();
        let lifecycle = Arc::new(Lifecycle::new());
        let queue = Arc::new(DelayQueue::new());
        let dispatcher = Dispatcher::new(
            name.clone(),
            &config.pool,
            config.dispatcher,
            Arc::clone(&queue),
            Arc::clone(&lifecycle),
        );
        tracing::info!(
            scheduler = %name,
            core_pool_size = config.pool.core_pool_size,
            "scheduler started"
        );
        Self {
            scheduler: AppScheduler {
                inner: Arc::new(ServiceInner {
                    name,
                    lifecycle,
                    queue,
                    dispatcher,
                    next_id: AtomicU64::new(0),
                }),
            },
        }
    }

    /// A restricted handle for arbitrary callers.
    pub fn scheduler(&self) -> AppScheduler {
        self.scheduler.clone()
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// Begin the real shutdown. Idempotent; does not wait.
    ///
    /// New submissions are rejected from now on. Periodic tasks are
    /// cancelled, pending one-shot tasks are run or cancelled depending on
    /// configuration, and the service terminates once the backend pool has
    /// drained.
    pub fn dispose(&self) {
        self.scheduler.inner.dispose();
    }

    /// Dispose and wait up to `timeout` for termination.
    pub fn dispose_and_wait(&self, timeout: Duration) -> ShutdownResult {
        let inner = &self.scheduler.inner;
        inner.dispose();
        if inner.lifecycle.await_terminated(timeout) {
            return ShutdownResult::Complete;
        }

        let residual = inner.queue.describe_entries();
        let stats = inner.stats();
        tracing::warn!(
            scheduler = %inner.name,
            pending_delayed = residual.len(),
            active_workers = stats.active_workers,
            ?timeout,
            "scheduler did not terminate in time"
        );
        for task in &residual {
            tracing::warn!(scheduler = %inner.name, task = %task, "still pending");
        }
        ShutdownResult::Timeout {
            pending_delayed: residual.len(),
            active_workers: stats.active_workers,
        }
    }

    /// Resize the backend pool. Shrinking never interrupts running tasks.
    pub fn set_core_pool_size(&self, size: usize) -> Result<(), SchedulerError> {
        if size == 0 {
            return Err(SchedulerError::InvalidArgument(
                "core pool size must be at least 1".to_string(),
            ));
        }
        self.scheduler.inner.dispatcher.pool().set_core_pool_size(size);
        Ok(())
    }

    /// Start up to `count` idle workers (bounded by the core size).
    /// Returns how many were started; fails only if none could be.
    pub fn prestart_core_threads(&self, count: usize) -> Result<usize, SchedulerError> {
        self.scheduler.inner.dispatcher.prestart(count)
    }

    /// Replace the factory used for workers started from now on.
    pub fn set_thread_factory(&self, factory: Arc<dyn ThreadFactory>) {
        self.scheduler.inner.dispatcher.pool().set_thread_factory(factory);
    }

    /// Diagnostic descriptions of tasks still waiting in the delay queue.
    pub fn pending_tasks(&self) -> Vec<String> {
        self.scheduler.inner.queue.describe_entries()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.inner.stats()
    }
}

impl Drop for SchedulerOwner {
    fn drop(&mut self) {
        self.scheduler.inner.dispose();
    }
}

impl fmt::Debug for SchedulerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerOwner")
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
