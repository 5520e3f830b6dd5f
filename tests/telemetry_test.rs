//! Telemetry module tests.

use std::time::Duration;

use gg_scheduler::telemetry::{init_logging, init_metrics, LogConfig, LogError, LogFormat};
use gg_scheduler::{PoolConfig, SchedulerOwner, ServiceConfig};

// =============================================================================
// LogConfig Tests
// =============================================================================

#[test]
fn log_config_default_is_json() {
    let config = LogConfig::default();
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, "gg_scheduler=info");
    assert!(config.output_path.is_none());
}

#[test]
fn log_format_parses_known_names() {
    assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
    assert!("yaml".parse::<LogFormat>().is_err());
}

// =============================================================================
// LogError Tests
// =============================================================================

#[test]
fn log_error_invalid_filter_display() {
    let error = LogError::InvalidFilter("bad filter".to_string());
    assert!(error.to_string().contains("Invalid log filter"));
    assert!(error.to_string().contains("bad filter"));
}

#[test]
fn log_error_file_open_display() {
    let error = LogError::FileOpen("permission denied".to_string());
    assert!(error.to_string().contains("Failed to open log file"));
    assert!(error.to_string().contains("permission denied"));
}

#[test]
fn log_error_already_initialized_display() {
    let error = LogError::AlreadyInitialized;
    assert!(error.to_string().contains("already initialized"));
}

#[test]
fn log_file_in_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        format: LogFormat::Json,
        level: "info".to_string(),
        output_path: Some(dir.path().join("missing").join("sched.log")),
    };
    assert!(matches!(init_logging(&config), Err(LogError::FileOpen(_))));
}

// =============================================================================
// Subscriber Installation
// =============================================================================

// The global subscriber can only be installed once per process, so every
// assertion that depends on it lives in this single test.
#[test]
fn json_log_file_records_lifecycle_with_thread_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sched.log");
    let config = LogConfig {
        format: LogFormat::Json,
        level: "gg_scheduler=debug".to_string(),
        output_path: Some(path.clone()),
    };
    init_logging(&config).unwrap();
    assert!(matches!(init_logging(&config), Err(LogError::AlreadyInitialized)));

    let owner = SchedulerOwner::new(
        "logged",
        ServiceConfig {
            pool: PoolConfig::with_core_size(1),
            ..Default::default()
        },
    );
    owner
        .scheduler()
        .schedule(|| (), Duration::from_millis(5))
        .unwrap()
        .get()
        .unwrap();
    owner.dispose_and_wait(Duration::from_secs(5));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("scheduler started"));
    assert!(contents.contains("scheduler terminated"));
    assert!(contents.contains("\"threadName\""));
    assert!(contents.contains("logged-dispatcher"));
    for line in contents.lines() {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
}

// =============================================================================
// Metrics Tests
// =============================================================================

#[test]
fn metrics_work_without_recorder() {
    init_metrics();
    let owner = SchedulerOwner::new("metrics", ServiceConfig::default());
    assert_eq!(owner.scheduler().submit(|| 3).unwrap().get().unwrap(), 3);
}
