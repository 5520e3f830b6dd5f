//! Metric names and recording helpers.

use std::time::Duration;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};

const TASKS_SUBMITTED: &str = "gg_sched_tasks_submitted_total";
const TASKS_FINISHED: &str = "gg_sched_tasks_finished_total";
const TASKS_CANCELLED: &str = "gg_sched_tasks_cancelled_total";
const TRANSFER_FAILURES: &str = "gg_sched_transfer_failures_total";
const POOL_SIZE: &str = "gg_sched_pool_threads";
const DELAY_QUEUE_DEPTH: &str = "gg_sched_delay_queue_depth";
const DISPATCH_LAG: &str = "gg_sched_dispatch_lag_seconds";
const EXECUTION_TIME: &str = "gg_sched_execution_seconds";

/// Register metric descriptions with the installed recorder.
///
/// Call once after installing a recorder. Recording works without it.
pub fn init_metrics() {
    describe_counter!(TASKS_SUBMITTED, Unit::Count, "Tasks accepted, by kind");
    describe_counter!(TASKS_FINISHED, Unit::Count, "Tasks that reached a final outcome, by outcome");
    describe_counter!(TASKS_CANCELLED, Unit::Count, "Tasks cancelled by callers or by shutdown");
    describe_counter!(TRANSFER_FAILURES, Unit::Count, "Failed hand-offs from the delay queue to the backend pool");
    describe_gauge!(POOL_SIZE, Unit::Count, "Live backend worker threads");
    describe_gauge!(DELAY_QUEUE_DEPTH, Unit::Count, "Tasks waiting in the delay queue");
    describe_histogram!(DISPATCH_LAG, Unit::Seconds, "Actual start time minus trigger time");
    describe_histogram!(EXECUTION_TIME, Unit::Seconds, "Task body execution time");
}

/// `kind` is one of `immediate`, `delayed`, `fixed_rate`, `fixed_delay`.
pub(crate) fn record_task_submitted(kind: &'static str) {
    counter!(TASKS_SUBMITTED, "kind" => kind).increment(1);
}

/// `outcome` is one of `done`, `failed`, `rejected`.
pub(crate) fn record_task_finished(outcome: &'static str) {
    counter!(TASKS_FINISHED, "outcome" => outcome).increment(1);
}

pub(crate) fn record_task_cancelled() {
    counter!(TASKS_CANCELLED).increment(1);
}

pub(crate) fn record_transfer_failure() {
    counter!(TRANSFER_FAILURES).increment(1);
}

pub(crate) fn record_pool_size(live: usize) {
    gauge!(POOL_SIZE).set(live as f64);
}

pub(crate) fn record_delay_queue_depth(depth: usize) {
    gauge!(DELAY_QUEUE_DEPTH).set(depth as f64);
}

pub(crate) fn record_dispatch_lag(lag: Duration) {
    histogram!(DISPATCH_LAG).record(lag.as_secs_f64());
}

pub(crate) fn record_execution_time(elapsed: Duration) {
    histogram!(EXECUTION_TIME).record(elapsed.as_secs_f64());
}
