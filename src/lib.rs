//! GG Scheduler
//!
//! An in-process service that runs work after a delay, periodically, or as
//! soon as possible on a bounded, resizable pool of worker threads.
//!
//! # Architecture
//!
//! - **Delay queue**: time-ordered holding area for tasks that are not yet due
//! - **Dispatcher**: one thread moving due tasks into the backend pool
//! - **Backend pool**: worker threads that run task bodies
//! - **Facade**: [`SchedulerOwner`] (privileged) and [`AppScheduler`] (shared)
//!
//! # Ownership
//!
//! Exactly one [`SchedulerOwner`] exists per service. It alone may dispose
//! the service or reconfigure its pool. Ordinary callers hold cloned
//! [`AppScheduler`] handles whose `shutdown` calls always fail with
//! [`SchedulerError::PolicyViolation`].
//!
//! ```no_run
//! use std::time::Duration;
//! use gg_scheduler::{SchedulerOwner, ServiceConfig};
//!
//! let owner = SchedulerOwner::new("app", ServiceConfig::default());
//! let scheduler = owner.scheduler();
//!
//! let answer = scheduler.schedule(|| 42, Duration::from_millis(10)).unwrap();
//! assert_eq!(answer.get().unwrap(), 42);
//!
//! owner.dispose_and_wait(Duration::from_secs(5));
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod telemetry;

pub use config::ServiceConfig;
pub use error::{SchedulerError, TaskError, TaskFailure};
pub use scheduler::{
    interrupted, DispatcherConfig, NamedThreadFactory, PoolConfig, Repeat, TaskHandle, TaskState,
    ThreadFactory,
};
pub use service::{AppScheduler, BackendPoolView, SchedulerOwner, SchedulerStats};
pub use shutdown::{LifecycleState, ShutdownResult};
