//! Service configuration and loading from environment variables.
//!
//! All values are read from `GG_SCHED_*` environment variables with sensible
//! defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_SCHED_CORE_POOL_SIZE` | max(cpus * 4, 16) | Backend pool core size |
//! | `GG_SCHED_KEEP_ALIVE_SECS` | 60 | Idle time before an excess worker retires |
//! | `GG_SCHED_THREAD_STACK_SIZE` | 0 | Worker stack size in bytes (0 = default) |
//! | `GG_SCHED_PUMP_IDLE_MS` | 10000 | Idle time before the dispatcher exits |
//! | `GG_SCHED_TRANSFER_RETRIES` | 5 | Failed pool hand-offs before rejecting a task |
//! | `GG_SCHED_TRANSFER_BACKOFF_MS` | 10 | First retry delay (doubles, capped at 1 s) |
//! | `GG_SCHED_RUN_DELAYED_ON_SHUTDOWN` | true | Run or cancel not-yet-due tasks on disposal |
//! | `GG_SCHED_SHUTDOWN_TIMEOUT` | 30 | Bounded disposal wait (secs) |
//! | `GG_SCHED_LOG_FORMAT` | json | `json`, `pretty` or `compact` |
//! | `GG_SCHED_LOG_LEVEL` | gg_scheduler=info | Tracing filter directives |

use std::time::Duration;

use serde::Serialize;

use crate::scheduler::{default_core_pool_size, DispatcherConfig, PoolConfig};
use crate::telemetry::{LogConfig, LogFormat};

/// Complete configuration of one scheduling service.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub pool: PoolConfig,
    pub dispatcher: DispatcherConfig,
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub core_pool_size: usize,
    pub keep_alive_secs: u64,
    pub thread_name_prefix: String,
    pub thread_stack_size: usize,
    pub pump_idle_ms: u64,
    pub transfer_retry_limit: u32,
    pub transfer_retry_backoff_ms: u64,
    pub run_delayed_on_shutdown: bool,
    pub shutdown_timeout_secs: u64,
    pub log_format: String,
    pub log_level: String,
}

/// All configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub service: ServiceConfig,
    pub shutdown_timeout: Duration,
    pub logging: LogConfig,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`1/true/yes/on`, `0/false/no/off`).
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Load backend pool configuration from environment.
fn load_pool_config() -> PoolConfig {
    let defaults = PoolConfig::default();
    let core = parse_usize("GG_SCHED_CORE_POOL_SIZE", default_core_pool_size());
    let keep_alive = parse_u64("GG_SCHED_KEEP_ALIVE_SECS", defaults.keep_alive.as_secs());
    let stack_size = parse_usize("GG_SCHED_THREAD_STACK_SIZE", defaults.stack_size);
    let core = core.clamp(1, 4096);
    let keep_alive = keep_alive.max(1);
    // 0 keeps the platform default; anything else gets a 64 KiB floor.
    let stack_size = if stack_size == 0 { 0 } else { stack_size.max(64 * 1024) };
    PoolConfig {
        core_pool_size: core,
        keep_alive: Duration::from_secs(keep_alive),
        thread_name_prefix: defaults.thread_name_prefix,
        stack_size,
    }
}

/// Load dispatcher configuration from environment.
fn load_dispatcher_config() -> DispatcherConfig {
    let defaults = DispatcherConfig::default();
    let idle_ms = parse_u64("GG_SCHED_PUMP_IDLE_MS", defaults.idle_timeout.as_millis() as u64);
    let retries = parse_u32("GG_SCHED_TRANSFER_RETRIES", defaults.transfer_retry_limit);
    let backoff_ms = parse_u64(
        "GG_SCHED_TRANSFER_BACKOFF_MS",
        defaults.transfer_retry_backoff.as_millis() as u64,
    );
    let run_delayed = parse_bool("GG_SCHED_RUN_DELAYED_ON_SHUTDOWN", defaults.run_delayed_on_shutdown);
    let idle_ms = idle_ms.max(10);
    let retries = retries.clamp(1, 100);
    let backoff_ms = backoff_ms.clamp(1, 1000);
    DispatcherConfig {
        idle_timeout: Duration::from_millis(idle_ms),
        transfer_retry_limit: retries,
        transfer_retry_backoff: Duration::from_millis(backoff_ms),
        run_delayed_on_shutdown: run_delayed,
    }
}

/// Load logging configuration from environment.
fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let format = std::env::var("GG_SCHED_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(defaults.format);
    let level = std::env::var("GG_SCHED_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.level);
    LogConfig {
        format,
        level,
        output_path: None,
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let shutdown_secs = parse_u64("GG_SCHED_SHUTDOWN_TIMEOUT", 30);
    let shutdown_secs = shutdown_secs.max(1);

    EnvConfig {
        service: ServiceConfig {
            pool: load_pool_config(),
            dispatcher: load_dispatcher_config(),
        },
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        logging: load_log_config(),
    }
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        let pool = &self.service.pool;
        let dispatcher = &self.service.dispatcher;
        EffectiveConfig {
            core_pool_size: pool.core_pool_size,
            keep_alive_secs: pool.keep_alive.as_secs(),
            thread_name_prefix: pool.thread_name_prefix.clone(),
            thread_stack_size: pool.stack_size,
            pump_idle_ms: dispatcher.idle_timeout.as_millis() as u64,
            transfer_retry_limit: dispatcher.transfer_retry_limit,
            transfer_retry_backoff_ms: dispatcher.transfer_retry_backoff.as_millis() as u64,
            run_delayed_on_shutdown: dispatcher.run_delayed_on_shutdown,
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            log_format: format!("{:?}", self.logging.format).to_ascii_lowercase(),
            log_level: self.logging.level.clone(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            logging: LogConfig::default(),
        }
    }
}
