//! Delayed and periodic task scheduling.
//!
//! A task record ([`task`]) waits in the [`delay_queue`] until due, is moved
//! by the single [`dispatcher`] thread into the [`pool`], and is observed by
//! callers through a [`TaskHandle`].

mod delay_queue;
mod dispatcher;
mod handle;
mod pool;
mod task;

pub(crate) use delay_queue::DelayQueue;
pub(crate) use dispatcher::Dispatcher;
pub(crate) use task::{deadline_after, TaskCell};

pub use dispatcher::DispatcherConfig;
pub use handle::TaskHandle;
pub use pool::{default_core_pool_size, NamedThreadFactory, PoolConfig, ThreadFactory};
pub use task::{interrupted, Repeat, TaskState};
