//! Bounded, resizable backend pool that executes ready tasks.
//!
//! Workers are started lazily up to the core size, park on a shared
//! condition variable while idle, and retire once they have been idle for
//! the keep-alive period while the pool is above its core size. During
//! shutdown the floor drops to zero: workers drain the queue and exit.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use thiserror::Error;

use super::task::{Job, RunOutcome};
use crate::error::TaskFailure;
use crate::telemetry;

/// Configuration for the backend pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of worker threads.
    pub core_pool_size: usize,
    /// How long an excess worker stays idle before retiring.
    pub keep_alive: Duration,
    /// Worker thread name prefix.
    pub thread_name_prefix: String,
    /// Thread stack size in bytes (0 = platform default).
    pub stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_pool_size: default_core_pool_size(),
            keep_alive: Duration::from_secs(60),
            thread_name_prefix: "gg-sched-worker".to_string(),
            stack_size: 0,
        }
    }
}

impl PoolConfig {
    /// Create config with a specific core size.
    pub fn with_core_size(core_pool_size: usize) -> Self {
        Self {
            core_pool_size: core_pool_size.max(1),
            ..Default::default()
        }
    }
}

/// Default core size: generous, since pooled tasks often block.
pub fn default_core_pool_size() -> usize {
    (num_cpus::get() * 4).max(16)
}

/// Starts the threads backing pool workers.
pub trait ThreadFactory: Send + Sync {
    /// Start a thread running `work`. `index` is unique within the pool.
    ///
    /// An error, or a panic, leaves the task queued for an existing worker,
    /// or refused if the pool has no live worker at all.
    fn spawn(
        &self,
        index: u64,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<thread::JoinHandle<()>>;
}

/// Names workers `<prefix>-<index>`.
#[derive(Debug, Clone)]
pub struct NamedThreadFactory {
    prefix: String,
    stack_size: usize,
}

impl NamedThreadFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            stack_size: 0,
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }
}

impl ThreadFactory for NamedThreadFactory {
    fn spawn(
        &self,
        index: u64,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<thread::JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.prefix, index));
        if self.stack_size > 0 {
            builder = builder.stack_size(self.stack_size);
        }
        builder.spawn(work)
    }
}

/// Receives periodic records that must go back to the delay queue.
pub(crate) trait Requeue: Send + Sync {
    fn requeue(&self, job: Arc<dyn Job>);
}

/// Errors for backend pool operations.
#[derive(Debug, Error)]
pub(crate) enum PoolError {
    #[error("Backend pool is shut down")]
    Shutdown,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Point-in-time pool statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolSnapshot {
    pub core_pool_size: usize,
    pub current_pool_size: usize,
    pub largest_pool_size: usize,
    pub active: usize,
    pub idle: usize,
    pub queued: usize,
    pub completed: u64,
}

struct PoolState {
    queue: VecDeque<Arc<dyn Job>>,
    core_size: usize,
    live: usize,
    idle: usize,
    active: usize,
    largest: usize,
    next_index: u64,
    closing: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    drained: Condvar,
    keep_alive: Duration,
    factory: RwLock<Arc<dyn ThreadFactory>>,
    requeue: Weak<dyn Requeue>,
    completed: AtomicU64,
}

/// Worker-thread pool executing task bodies.
pub(crate) struct BackendPool {
    shared: Arc<PoolShared>,
}

impl BackendPool {
    pub fn new(config: &PoolConfig, requeue: Weak<dyn Requeue>) -> Self {
        let factory = NamedThreadFactory::new(config.thread_name_prefix.clone())
            .with_stack_size(config.stack_size);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                core_size: config.core_pool_size.max(1),
                live: 0,
                idle: 0,
                active: 0,
                largest: 0,
                next_index: 0,
                closing: false,
            }),
            work_available: Condvar::new(),
            drained: Condvar::new(),
            keep_alive: config.keep_alive,
            factory: RwLock::new(Arc::new(factory)),
            requeue,
            completed: AtomicU64::new(0),
        });
        Self { shared }
    }

    /// Queue a record for execution, starting a worker if none is free.
    pub fn execute(&self, job: Arc<dyn Job>) -> Result<(), PoolError> {
        let mut st = self.shared.state.lock();
        if st.closing {
            return Err(PoolError::Shutdown);
        }
        st.queue.push_back(job);

        if st.queue.len() <= st.idle {
            self.shared.work_available.notify_one();
            return Ok(());
        }

        if st.live < st.core_size {
            if let Err(err) = Self::spawn_worker(&self.shared, &mut st) {
                if st.live == 0 {
                    // Nobody would ever pick it up.
                    st.queue.pop_back();
                    return Err(err);
                }
                tracing::warn!(error = %err, live = st.live, "backend pool could not grow; task queued");
            }
        }
        Ok(())
    }

    /// Eagerly start up to `count` idle workers, bounded by the core size.
    pub fn prestart(&self, count: usize) -> Result<usize, PoolError> {
        let mut st = self.shared.state.lock();
        if st.closing {
            return Err(PoolError::Shutdown);
        }
        let mut started = 0;
        while started < count && st.live < st.core_size {
            if let Err(err) = Self::spawn_worker(&self.shared, &mut st) {
                if started == 0 {
                    return Err(err);
                }
                tracing::warn!(error = %err, requested = count, started, "backend pool prestart stopped early");
                break;
            }
            started += 1;
        }
        Ok(started)
    }

    /// Change the target size. Returns the previous value.
    ///
    /// Shrinking never interrupts running work; excess workers retire after
    /// their keep-alive expires. Growing starts workers for work that is
    /// already queued and otherwise takes effect on the next demand.
    pub fn set_core_pool_size(&self, size: usize) -> usize {
        let mut st = self.shared.state.lock();
        let previous = st.core_size;
        st.core_size = size.max(1);
        tracing::debug!(previous, core = st.core_size, live = st.live, "backend pool resized");

        if !st.closing {
            let waiting = st.queue.len().saturating_sub(st.idle);
            let room = st.core_size.saturating_sub(st.live);
            for _ in 0..waiting.min(room) {
                if let Err(err) = Self::spawn_worker(&self.shared, &mut st) {
                    tracing::warn!(error = %err, live = st.live, "backend pool could not grow for queued work");
                    break;
                }
            }
        }
        previous
    }

    /// Take a record back out of the run queue. Returns false if it is not
    /// queued (never accepted, or already picked up by a worker).
    pub fn withdraw(&self, job: &Arc<dyn Job>) -> bool {
        let mut st = self.shared.state.lock();
        match st.queue.iter().position(|queued| Arc::ptr_eq(queued, job)) {
            Some(pos) => {
                st.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn core_pool_size(&self) -> usize {
        self.shared.state.lock().core_size
    }

    pub fn current_pool_size(&self) -> usize {
        self.shared.state.lock().live
    }

    pub fn set_thread_factory(&self, factory: Arc<dyn ThreadFactory>) {
        *self.shared.factory.write() = factory;
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let st = self.shared.state.lock();
        PoolSnapshot {
            core_pool_size: st.core_size,
            current_pool_size: st.live,
            largest_pool_size: st.largest,
            active: st.active,
            idle: st.idle,
            queued: st.queue.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work; workers drain the queue and exit.
    ///
    /// Work queued while no worker is alive gets one last worker to run it,
    /// or is rejected if that worker cannot be started.
    pub fn shutdown(&self) {
        let mut st = self.shared.state.lock();
        st.closing = true;
        self.shared.work_available.notify_all();
        if st.live > 0 {
            return;
        }

        if !st.queue.is_empty() {
            match Self::spawn_worker(&self.shared, &mut st) {
                Ok(()) => return,
                Err(err) => {
                    for job in st.queue.drain(..) {
                        tracing::error!(task = job.id(), error = %err, "rejecting task stranded in backend pool");
                        job.reject(format!("backend pool shut down with no worker to run it: {err}"));
                    }
                }
            }
        }
        self.shared.drained.notify_all();
    }

    /// Wait until shut down with the queue empty and every worker exited.
    pub fn await_termination(&self, deadline: Option<Instant>) -> bool {
        let mut st = self.shared.state.lock();
        while !Self::is_drained(&st) {
            match deadline {
                Some(deadline) => {
                    if self.shared.drained.wait_until(&mut st, deadline).timed_out() {
                        return Self::is_drained(&st);
                    }
                }
                None => self.shared.drained.wait(&mut st),
            }
        }
        true
    }

    fn is_drained(st: &PoolState) -> bool {
        st.closing && st.live == 0 && st.queue.is_empty()
    }

    fn spawn_worker(shared: &Arc<PoolShared>, st: &mut PoolState) -> Result<(), PoolError> {
        let index = st.next_index;
        let factory = Arc::clone(&*shared.factory.read());
        let worker_shared = Arc::clone(shared);
        let work: Box<dyn FnOnce() + Send + 'static> =
            Box::new(move || Self::worker_loop(worker_shared, index));
        let _detached = match panic::catch_unwind(AssertUnwindSafe(|| factory.spawn(index, work))) {
            Ok(spawned) => spawned.map_err(|e| PoolError::Spawn(e.to_string()))?,
            Err(payload) => {
                let failure = TaskFailure::from_panic(payload);
                return Err(PoolError::Spawn(format!("thread factory {failure}")));
            }
        };

        st.next_index += 1;
        st.live += 1;
        st.largest = st.largest.max(st.live);
        telemetry::record_pool_size(st.live);
        tracing::debug!(worker = index, live = st.live, core = st.core_size, "backend worker started");
        Ok(())
    }

    /// Worker thread main loop.
    fn worker_loop(shared: Arc<PoolShared>, index: u64) {
        let mut st = shared.state.lock();
        loop {
            if let Some(job) = st.queue.pop_front() {
                st.active += 1;
                MutexGuard::unlocked(&mut st, || Self::run_job(&shared, job));
                st.active -= 1;
                continue;
            }

            if st.closing {
                break;
            }

            st.idle += 1;
            let timed_out = shared
                .work_available
                .wait_for(&mut st, shared.keep_alive)
                .timed_out();
            st.idle -= 1;

            if timed_out && st.queue.is_empty() && st.live > st.core_size {
                break;
            }
        }

        st.live -= 1;
        telemetry::record_pool_size(st.live);
        if st.live == 0 {
            shared.drained.notify_all();
        }
        drop(st);
        tracing::debug!(worker = index, "backend worker retired");
    }

    fn run_job(shared: &PoolShared, job: Arc<dyn Job>) {
        if job.run() == RunOutcome::Reschedule {
            match shared.requeue.upgrade() {
                Some(requeue) => requeue.requeue(job),
                None => {
                    job.cancel_for_shutdown();
                }
            }
        }
        shared.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{Repeat, TaskCell, TaskState};
    use std::collections::HashSet;
    use std::sync::mpsc;

    struct Unused;

    impl Requeue for Unused {
        fn requeue(&self, _job: Arc<dyn Job>) {}
    }

    fn no_requeue() -> Weak<dyn Requeue> {
        Weak::<Unused>::new()
    }

    fn pool(core: usize) -> BackendPool {
        BackendPool::new(&PoolConfig::with_core_size(core), no_requeue())
    }

    fn thread_name_job(tx: mpsc::Sender<String>, hold: Duration) -> Arc<TaskCell<()>> {
        Arc::new(TaskCell::once(0, Instant::now(), move || {
            thread::sleep(hold);
            let name = thread::current().name().unwrap_or("unnamed").to_string();
            tx.send(name).unwrap();
        }))
    }

    #[test]
    fn test_execute_spawns_worker_lazily() {
        let pool = pool(4);
        assert_eq!(pool.current_pool_size(), 0);

        let job = Arc::new(TaskCell::once(1, Instant::now(), || 7));
        pool.execute(job.clone()).unwrap();
        assert!(job.wait(Some(Instant::now() + Duration::from_secs(5))));
        assert_eq!(job.take_outcome().unwrap().unwrap(), 7);
        assert_eq!(pool.current_pool_size(), 1);
    }

    #[test]
    fn test_sequential_jobs_reuse_idle_worker() {
        let pool = pool(4);
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            pool.execute(thread_name_job(tx.clone(), Duration::ZERO)).unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(pool.current_pool_size(), 1);
    }

    #[test]
    fn test_concurrent_jobs_use_distinct_threads() {
        let pool = pool(8);
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            pool.execute(thread_name_job(tx.clone(), Duration::from_millis(200))).unwrap();
        }
        let names: HashSet<String> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(names.len(), 8);
        assert!(names.iter().all(|n| n.starts_with("gg-sched-worker-")));
    }

    #[test]
    fn test_pool_never_exceeds_core_size() {
        let pool = pool(2);
        let (tx, rx) = mpsc::channel();
        for _ in 0..5 {
            pool.execute(thread_name_job(tx.clone(), Duration::from_millis(30))).unwrap();
        }
        assert_eq!(pool.current_pool_size(), 2);
        for _ in 0..5 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(pool.snapshot().largest_pool_size, 2);
    }

    #[test]
    fn test_prestart_is_bounded_by_core_size() {
        let pool = pool(3);
        assert_eq!(pool.prestart(10).unwrap(), 3);
        assert_eq!(pool.current_pool_size(), 3);
        assert_eq!(pool.prestart(1).unwrap(), 0);
    }

    #[test]
    fn test_shrink_retires_idle_workers_after_keep_alive() {
        let config = PoolConfig {
            core_pool_size: 3,
            keep_alive: Duration::from_millis(50),
            ..Default::default()
        };
        let pool = BackendPool::new(&config, no_requeue());
        pool.prestart(3).unwrap();

        assert_eq!(pool.set_core_pool_size(1), 3);
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.current_pool_size() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.current_pool_size(), 1);
    }

    #[test]
    fn test_shrink_does_not_interrupt_running_work() {
        let pool = pool(2);
        let (tx, rx) = mpsc::channel();
        pool.execute(thread_name_job(tx.clone(), Duration::from_millis(100))).unwrap();
        pool.execute(thread_name_job(tx, Duration::from_millis(100))).unwrap();

        pool.set_core_pool_size(1);
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_shutdown_drains_queue_then_terminates() {
        let pool = pool(1);
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            pool.execute(thread_name_job(tx.clone(), Duration::from_millis(20))).unwrap();
        }
        pool.shutdown();
        assert!(matches!(
            pool.execute(thread_name_job(tx, Duration::ZERO)),
            Err(PoolError::Shutdown)
        ));

        assert!(pool.await_termination(Some(Instant::now() + Duration::from_secs(5))));
        assert_eq!(rx.try_iter().count(), 3);
        assert_eq!(pool.current_pool_size(), 0);
    }

    #[test]
    fn test_custom_thread_factory_names_workers() {
        let pool = pool(1);
        pool.set_thread_factory(Arc::new(NamedThreadFactory::new("custom")));
        let (tx, rx) = mpsc::channel();
        pool.execute(thread_name_job(tx, Duration::ZERO)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "custom-0");
    }

    struct Refusing;

    impl ThreadFactory for Refusing {
        fn spawn(
            &self,
            _index: u64,
            _work: Box<dyn FnOnce() + Send + 'static>,
        ) -> io::Result<thread::JoinHandle<()>> {
            Err(io::Error::new(io::ErrorKind::Other, "no threads today"))
        }
    }

    #[test]
    fn test_spawn_failure_without_workers_refuses_task() {
        let pool = pool(2);
        pool.set_thread_factory(Arc::new(Refusing));
        let job = Arc::new(TaskCell::once(1, Instant::now(), || ()));

        let err = pool.execute(job.clone()).unwrap_err();
        assert!(matches!(err, PoolError::Spawn(ref msg) if msg.contains("no threads today")));
        assert_eq!(pool.snapshot().queued, 0);
        assert_eq!(job.state(), TaskState::Pending);
    }

    #[test]
    fn test_spawn_failure_with_live_worker_queues_task() {
        let pool = pool(2);
        pool.prestart(1).unwrap();
        pool.set_thread_factory(Arc::new(Refusing));

        let (tx, rx) = mpsc::channel();
        pool.execute(thread_name_job(tx.clone(), Duration::from_millis(50))).unwrap();
        pool.execute(thread_name_job(tx, Duration::ZERO)).unwrap();
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(pool.current_pool_size(), 1);
    }

    #[test]
    fn test_periodic_job_without_requeue_target_is_cancelled() {
        let pool = pool(1);
        let job = Arc::new(TaskCell::repeating(
            1,
            Instant::now(),
            Repeat::FixedRate(Duration::from_millis(10)),
            || {},
        ));
        pool.execute(job.clone()).unwrap();
        assert!(job.wait(Some(Instant::now() + Duration::from_secs(5))));
        assert_eq!(job.state(), TaskState::Cancelled);
    }

    struct Panicking;

    impl ThreadFactory for Panicking {
        fn spawn(
            &self,
            _index: u64,
            _work: Box<dyn FnOnce() + Send + 'static>,
        ) -> io::Result<thread::JoinHandle<()>> {
            panic!("factory exploded");
        }
    }

    #[test]
    fn test_panicking_factory_refuses_task_without_stranding_it() {
        let pool = pool(2);
        pool.set_thread_factory(Arc::new(Panicking));
        let job = Arc::new(TaskCell::once(1, Instant::now(), || ()));

        let err = pool.execute(job.clone()).unwrap_err();
        assert!(matches!(err, PoolError::Spawn(ref msg) if msg.contains("factory exploded")));
        assert_eq!(pool.snapshot().queued, 0);
        assert_eq!(pool.current_pool_size(), 0);

        pool.shutdown();
        assert!(pool.await_termination(Some(Instant::now() + Duration::from_secs(5))));
    }

    /// Spawns a fixed number of threads, then refuses.
    struct Limited {
        remaining: AtomicU64,
    }

    impl ThreadFactory for Limited {
        fn spawn(
            &self,
            index: u64,
            work: Box<dyn FnOnce() + Send + 'static>,
        ) -> io::Result<thread::JoinHandle<()>> {
            let allowed = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(io::Error::new(io::ErrorKind::Other, "thread limit reached"));
            }
            NamedThreadFactory::new("limited").spawn(index, work)
        }
    }

    #[test]
    fn test_prestart_reports_workers_started_before_failure() {
        let pool = pool(4);
        pool.set_thread_factory(Arc::new(Limited {
            remaining: AtomicU64::new(2),
        }));

        assert_eq!(pool.prestart(4).unwrap(), 2);
        assert_eq!(pool.current_pool_size(), 2);
        assert!(matches!(pool.prestart(1), Err(PoolError::Spawn(_))));
    }

    #[test]
    fn test_growing_core_size_starts_workers_for_queued_work() {
        let pool = pool(1);
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            pool.execute(thread_name_job(tx.clone(), Duration::from_millis(200))).unwrap();
        }
        assert_eq!(pool.current_pool_size(), 1);

        assert_eq!(pool.set_core_pool_size(3), 1);
        assert_eq!(pool.current_pool_size(), 3);
        let names: HashSet<String> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_withdraw_removes_only_queued_records() {
        let pool = pool(1);
        let (tx, rx) = mpsc::channel();
        pool.execute(thread_name_job(tx.clone(), Duration::from_millis(100))).unwrap();
        let queued: Arc<dyn Job> = thread_name_job(tx, Duration::ZERO);
        pool.execute(Arc::clone(&queued)).unwrap();

        assert!(pool.withdraw(&queued));
        assert!(!pool.withdraw(&queued));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(queued.state(), TaskState::Pending);
    }
}
