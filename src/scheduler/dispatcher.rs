//! The pump: a single thread that moves due tasks from the delay queue into
//! the backend pool.
//!
//! At most one pump runs at a time. It exits after an idle period with an
//! empty queue and is restarted by the next offer. After the queue is
//! closed it drains every remaining entry, shuts the pool down, waits for
//! the workers to finish and marks the service terminated.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::delay_queue::{DelayQueue, QueueClosed, Take};
use super::pool::{BackendPool, PoolConfig, PoolError, Requeue};
use super::task::{deadline_after, Job, TaskState};
use crate::error::{SchedulerError, TaskFailure};
use crate::shutdown::Lifecycle;
use crate::telemetry;

const MAX_TRANSFER_BACKOFF: Duration = Duration::from_secs(1);

/// Pump behaviour.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// The pump exits after the queue has been empty this long.
    pub idle_timeout: Duration,
    /// Failed hand-offs to the pool before a task is rejected.
    pub transfer_retry_limit: u32,
    /// First retry delay; doubles per attempt up to one second.
    pub transfer_retry_backoff: Duration,
    /// On disposal, run not-yet-due one-shot tasks instead of cancelling them.
    pub run_delayed_on_shutdown: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            transfer_retry_limit: 5,
            transfer_retry_backoff: Duration::from_millis(10),
            run_delayed_on_shutdown: true,
        }
    }
}

pub(crate) struct Dispatcher {
    name: String,
    this: Weak<Dispatcher>,
    queue: Arc<DelayQueue>,
    pool: BackendPool,
    lifecycle: Arc<Lifecycle>,
    config: DispatcherConfig,
    pump: Mutex<Option<JoinHandle<()>>>,
    pump_starts: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        name: String,
        pool_config: &PoolConfig,
        config: DispatcherConfig,
        queue: Arc<DelayQueue>,
        lifecycle: Arc<Lifecycle>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Dispatcher>| {
            let requeue: Weak<dyn Requeue> = this.clone();
            Self {
                name,
                this: this.clone(),
                queue,
                pool: BackendPool::new(pool_config, requeue),
                lifecycle,
                config,
                pump: Mutex::new(None),
                pump_starts: AtomicU64::new(0),
            }
        })
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn pump_starts(&self) -> u64 {
        self.pump_starts.load(Ordering::Relaxed)
    }

    /// Put a delayed record into the queue, starting the pump if needed.
    pub fn schedule(&self, job: Arc<dyn Job>) -> Result<(), SchedulerError> {
        let key = job.key();
        match self.queue.offer(job) {
            Ok(offered) => {
                if offered.needs_consumer {
                    if let Err(err) = self.start_pump() {
                        self.queue.remove(key);
                        return Err(err);
                    }
                }
                Ok(())
            }
            Err(QueueClosed) => Err(SchedulerError::Rejected {
                scheduler: self.name.clone(),
                state: self.lifecycle.state(),
            }),
        }
    }

    /// Hand an immediate record straight to the pool.
    pub fn execute_now(&self, job: Arc<dyn Job>) -> Result<(), SchedulerError> {
        self.pool.execute(job).map_err(|err| self.pool_error(err))
    }

    /// Start idle workers ahead of demand.
    pub fn prestart(&self, count: usize) -> Result<usize, SchedulerError> {
        let started = self.pool.prestart(count).map_err(|err| self.pool_error(err))?;
        tracing::debug!(scheduler = %self.name, started, "backend workers prestarted");
        Ok(started)
    }

    fn pool_error(&self, err: PoolError) -> SchedulerError {
        match err {
            PoolError::Shutdown => SchedulerError::Rejected {
                scheduler: self.name.clone(),
                state: self.lifecycle.state(),
            },
            PoolError::Spawn(reason) => SchedulerError::ThreadSpawn {
                role: "worker",
                reason,
            },
        }
    }

    /// Close the queue and make sure something drains it.
    ///
    /// Falls back to draining on the calling thread if no pump can be started.
    pub fn begin_drain(&self) {
        if !self.queue.close() {
            return;
        }
        if let Err(err) = self.start_pump() {
            tracing::warn!(
                scheduler = %self.name,
                error = %err,
                "dispatcher unavailable; draining on the disposing thread"
            );
            self.pump_loop();
        }
    }

    fn start_pump(&self) -> Result<(), SchedulerError> {
        let mut slot = self.pump.lock();
        if let Some(previous) = slot.take() {
            // The previous pump released its reservation and is exiting.
            if previous.thread().id() != thread::current().id() {
                let _ = previous.join();
            }
        }

        let this = self.this.upgrade().ok_or_else(|| SchedulerError::ThreadSpawn {
            role: "dispatcher",
            reason: "scheduler is being dropped".to_string(),
        })?;
        let spawned = thread::Builder::new()
            .name(format!("{}-dispatcher", self.name))
            .spawn(move || this.pump_loop());

        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                let starts = self.pump_starts.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(scheduler = %self.name, starts, "dispatcher started");
                Ok(())
            }
            Err(e) => {
                self.queue.consumer_failed();
                Err(SchedulerError::ThreadSpawn {
                    role: "dispatcher",
                    reason: e.to_string(),
                })
            }
        }
    }

    fn pump_loop(&self) {
        loop {
            match self.queue.take_ready(self.config.idle_timeout) {
                Take::Ready { job, early } => {
                    let handed =
                        panic::catch_unwind(AssertUnwindSafe(|| self.transfer(Arc::clone(&job), early)));
                    if let Err(payload) = handed {
                        self.handoff_panicked(job, TaskFailure::from_panic(payload));
                    }
                }
                Take::Idle => {
                    tracing::debug!(scheduler = %self.name, "dispatcher idle; exiting");
                    return;
                }
                Take::Closed => {
                    self.finish_shutdown();
                    return;
                }
            }
        }
    }

    fn transfer(&self, job: Arc<dyn Job>, early: bool) {
        if job.state() != TaskState::Pending {
            return;
        }

        let draining = early || self.queue.is_closed();
        if draining && job.is_periodic() {
            if job.cancel_for_shutdown() {
                tracing::debug!(scheduler = %self.name, task = job.id(), "periodic task cancelled by shutdown");
            }
            return;
        }
        if early && !self.config.run_delayed_on_shutdown {
            if job.cancel_for_shutdown() {
                tracing::debug!(scheduler = %self.name, task = job.id(), "delayed task cancelled by shutdown");
            }
            return;
        }
        if early && job.transfer_failures() > 0 {
            // Honour the retry backoff even though the queue releases entries early.
            let (trigger, _) = job.key();
            let wait = trigger.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }

        tracing::trace!(scheduler = %self.name, task = job.id(), early, "dispatching task");
        if let Err(err) = self.pool.execute(Arc::clone(&job)) {
            self.transfer_failed(job, err.to_string());
        }
    }

    /// A fault during hand-off counts as a failed transfer.
    fn handoff_panicked(&self, job: Arc<dyn Job>, failure: TaskFailure) {
        tracing::error!(
            scheduler = %self.name,
            task = job.id(),
            error = %failure,
            "fault while handing task to backend pool"
        );
        self.pool.withdraw(&job);
        if job.state() == TaskState::Pending {
            self.transfer_failed(job, format!("hand-off {failure}"));
        }
    }

    fn transfer_failed(&self, job: Arc<dyn Job>, reason: String) {
        telemetry::record_transfer_failure();
        let attempts = job.note_transfer_failure();
        if attempts >= self.config.transfer_retry_limit {
            tracing::error!(
                scheduler = %self.name,
                task = job.id(),
                attempts,
                error = %reason,
                "giving up on handing task to backend pool"
            );
            job.reject(format!("backend pool refused task after {attempts} attempts: {reason}"));
            return;
        }

        let backoff = self.retry_backoff(attempts);
        tracing::warn!(
            scheduler = %self.name,
            task = job.id(),
            attempts,
            retry_in = ?backoff,
            error = %reason,
            "handing task to backend pool failed; will retry"
        );
        job.postpone(deadline_after(Instant::now(), backoff));
        self.queue.offer_retry(job);
    }

    fn retry_backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.config
            .transfer_retry_backoff
            .saturating_mul(factor)
            .min(MAX_TRANSFER_BACKOFF)
    }

    fn finish_shutdown(&self) {
        tracing::debug!(scheduler = %self.name, "delay queue drained; stopping backend pool");
        self.pool.shutdown();
        self.pool.await_termination(None);
        tracing::info!(scheduler = %self.name, "scheduler terminated");
        self.lifecycle.mark_terminated();
    }
}

impl Requeue for Dispatcher {
    fn requeue(&self, job: Arc<dyn Job>) {
        let key = job.key();
        match self.queue.offer(Arc::clone(&job)) {
            Ok(offered) => {
                if offered.needs_consumer {
                    if let Err(err) = self.start_pump() {
                        tracing::error!(scheduler = %self.name, task = job.id(), error = %err, "cannot reschedule periodic task");
                        self.queue.remove(key);
                        job.reject(err.to_string());
                    }
                }
            }
            Err(QueueClosed) => {
                job.cancel_for_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::pool::{NamedThreadFactory, ThreadFactory};
    use crate::scheduler::task::{Repeat, RunOutcome, TaskCell, TaskKey};
    use std::io;
    use std::sync::atomic::AtomicBool;

    fn dispatcher(config: DispatcherConfig) -> Arc<Dispatcher> {
        Dispatcher::new(
            "test".to_string(),
            &PoolConfig::with_core_size(2),
            config,
            Arc::new(DelayQueue::new()),
            Arc::new(Lifecycle::new()),
        )
    }

    fn within(secs: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_secs(secs))
    }

    #[test]
    fn delayed_task_runs_after_its_trigger() {
        let d = dispatcher(DispatcherConfig::default());
        let start = Instant::now();
        let delay = Duration::from_millis(50);
        let job = Arc::new(TaskCell::once(1, start + delay, Instant::now));

        d.schedule(job.clone()).unwrap();
        assert!(job.wait(within(5)));
        let ran_at = job.take_outcome().unwrap().unwrap();
        assert!(ran_at >= start + delay);
        assert_eq!(d.pump_starts(), 1);
    }

    #[test]
    fn pump_exits_when_idle_and_restarts_on_offer() {
        let d = dispatcher(DispatcherConfig {
            idle_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let first = Arc::new(TaskCell::once(1, Instant::now(), || ()));
        d.schedule(first.clone()).unwrap();
        assert!(first.wait(within(5)));

        thread::sleep(Duration::from_millis(100));
        let second = Arc::new(TaskCell::once(2, Instant::now(), || ()));
        d.schedule(second.clone()).unwrap();
        assert!(second.wait(within(5)));
        assert_eq!(d.pump_starts(), 2);
    }

    #[test]
    fn periodic_task_is_requeued_until_cancelled() {
        let d = dispatcher(DispatcherConfig::default());
        let (tx, rx) = std::sync::mpsc::channel();
        let job = Arc::new(TaskCell::repeating(
            1,
            Instant::now(),
            Repeat::FixedDelay(Duration::from_millis(5)),
            move || {
                let _ = tx.send(());
            },
        ));
        d.schedule(job.clone()).unwrap();

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let cancel = job.cancel(false);
        assert!(cancel.cancelled);
        if let Some(key) = cancel.queued_key {
            d.queue.remove(key);
        }
        assert_eq!(job.state(), TaskState::Cancelled);
    }

    #[test]
    fn drain_runs_delayed_one_shot_and_cancels_periodic() {
        let d = dispatcher(DispatcherConfig::default());
        let later = Instant::now() + Duration::from_secs(60);
        let one_shot = Arc::new(TaskCell::once(1, later, || "ran"));
        let periodic = Arc::new(TaskCell::repeating(2, later, Repeat::FixedRate(Duration::from_secs(1)), || {}));
        d.schedule(one_shot.clone()).unwrap();
        d.schedule(periodic.clone()).unwrap();

        d.lifecycle.begin_shutdown();
        d.begin_drain();

        assert!(d.lifecycle.await_terminated(Duration::from_secs(5)));
        assert_eq!(one_shot.take_outcome().unwrap().unwrap(), "ran");
        assert_eq!(periodic.state(), TaskState::Cancelled);
        assert!(d.queue.is_empty());
    }

    #[test]
    fn drain_can_cancel_delayed_one_shot() {
        let d = dispatcher(DispatcherConfig {
            run_delayed_on_shutdown: false,
            ..Default::default()
        });
        let job = Arc::new(TaskCell::once(1, Instant::now() + Duration::from_secs(60), || ()));
        d.schedule(job.clone()).unwrap();

        d.lifecycle.begin_shutdown();
        d.begin_drain();

        assert!(d.lifecycle.await_terminated(Duration::from_secs(5)));
        assert_eq!(job.state(), TaskState::Cancelled);
    }

    #[test]
    fn schedule_after_close_is_rejected() {
        let d = dispatcher(DispatcherConfig::default());
        d.lifecycle.begin_shutdown();
        d.begin_drain();

        let job = Arc::new(TaskCell::once(1, Instant::now(), || ()));
        let err = d.schedule(job).unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let d = dispatcher(DispatcherConfig::default());
        assert_eq!(d.retry_backoff(1), Duration::from_millis(10));
        assert_eq!(d.retry_backoff(2), Duration::from_millis(20));
        assert_eq!(d.retry_backoff(4), Duration::from_millis(80));
        assert_eq!(d.retry_backoff(30), MAX_TRANSFER_BACKOFF);
    }

    /// Wraps a record so that the next state check made by the pump panics.
    struct FaultyHandoff {
        cell: Arc<TaskCell<u32>>,
        armed: AtomicBool,
    }

    impl Job for FaultyHandoff {
        fn id(&self) -> u64 {
            self.cell.id()
        }
        fn key(&self) -> TaskKey {
            self.cell.key()
        }
        fn state(&self) -> TaskState {
            if self.armed.swap(false, Ordering::SeqCst) {
                panic!("state check failed");
            }
            self.cell.state()
        }
        fn is_periodic(&self) -> bool {
            Job::is_periodic(&*self.cell)
        }
        fn run(&self) -> RunOutcome {
            self.cell.run()
        }
        fn cancel_for_shutdown(&self) -> bool {
            self.cell.cancel_for_shutdown()
        }
        fn reject(&self, reason: String) {
            self.cell.reject(reason)
        }
        fn postpone(&self, trigger: Instant) {
            self.cell.postpone(trigger)
        }
        fn note_transfer_failure(&self) -> u32 {
            self.cell.note_transfer_failure()
        }
        fn transfer_failures(&self) -> u32 {
            self.cell.transfer_failures()
        }
        fn describe(&self) -> String {
            self.cell.describe()
        }
    }

    #[test]
    fn handoff_fault_is_retried_and_pump_keeps_running() {
        let d = dispatcher(DispatcherConfig::default());
        let cell = Arc::new(TaskCell::once(1, Instant::now() + Duration::from_millis(50), || 7u32));
        let faulty = Arc::new(FaultyHandoff {
            cell: Arc::clone(&cell),
            armed: AtomicBool::new(false),
        });
        d.schedule(faulty.clone()).unwrap();
        faulty.armed.store(true, Ordering::SeqCst);

        assert!(cell.wait(within(5)));
        assert_eq!(cell.take_outcome().unwrap().unwrap(), 7);
        assert_eq!(cell.transfer_failures(), 1);

        let next = Arc::new(TaskCell::once(2, Instant::now(), || 8u32));
        d.schedule(next.clone()).unwrap();
        assert!(next.wait(within(5)));
        assert_eq!(next.take_outcome().unwrap().unwrap(), 8);
        assert_eq!(d.pump_starts(), 1);
    }

    struct Panicking;

    impl ThreadFactory for Panicking {
        fn spawn(
            &self,
            _index: u64,
            _work: Box<dyn FnOnce() + Send + 'static>,
        ) -> io::Result<thread::JoinHandle<()>> {
            panic!("worker factory blew up");
        }
    }

    #[test]
    fn panicking_factory_rejects_task_and_pump_survives() {
        let d = dispatcher(DispatcherConfig {
            transfer_retry_limit: 2,
            transfer_retry_backoff: Duration::from_millis(1),
            ..Default::default()
        });
        d.pool().set_thread_factory(Arc::new(Panicking));
        let doomed = Arc::new(TaskCell::once(1, Instant::now(), || ()));
        d.schedule(doomed.clone()).unwrap();

        assert!(doomed.wait(within(5)));
        assert_eq!(doomed.state(), TaskState::Failed);
        let err = doomed.take_outcome().unwrap().unwrap_err();
        assert!(err.to_string().contains("worker factory blew up"));
        assert_eq!(d.pool().snapshot().queued, 0);

        d.pool().set_thread_factory(Arc::new(NamedThreadFactory::new("recovered")));
        let next = Arc::new(TaskCell::once(2, Instant::now(), || "ran"));
        d.schedule(next.clone()).unwrap();
        assert!(next.wait(within(5)));
        assert_eq!(next.take_outcome().unwrap().unwrap(), "ran");
        assert_eq!(d.pump_starts(), 1);

        d.lifecycle.begin_shutdown();
        d.begin_drain();
        assert!(d.lifecycle.await_terminated(Duration::from_secs(5)));
        assert_eq!(d.pool().current_pool_size(), 0);
    }
}
