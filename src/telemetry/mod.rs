//! Telemetry for the scheduling service.
//!
//! Structured logging through `tracing` and metrics through the `metrics`
//! facade. The library never installs a metrics exporter; binaries decide.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::init_metrics;

pub(crate) use self::metrics::{
    record_delay_queue_depth, record_dispatch_lag, record_execution_time, record_pool_size,
    record_task_cancelled, record_task_finished, record_task_submitted, record_transfer_failure,
};
