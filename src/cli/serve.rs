// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! `serve`: run a scheduler with a periodic heartbeat until Ctrl-C, then drain.

use std::time::Duration;

use crate::config::EnvConfig;
use crate::shutdown::ShutdownResult;
use crate::SchedulerOwner;

/// Default interval between heartbeat log lines.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Parse `--heartbeat-secs N` from the arguments after the subcommand.
pub fn parse_heartbeat(args: &[String]) -> Result<Duration, String> {
    let mut heartbeat = DEFAULT_HEARTBEAT;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--heartbeat-secs" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "Missing value for --heartbeat-secs".to_string())?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid --heartbeat-secs value: {value}"))?;
                heartbeat = Duration::from_secs(secs.max(1));
                i += 2;
            }
            other => return Err(format!("Unknown argument: {other}")),
        }
    }
    Ok(heartbeat)
}

/// Run until Ctrl-C, then dispose the scheduler and wait for it to drain.
pub async fn run(env: EnvConfig, heartbeat: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let owner = SchedulerOwner::new("gg-scheduler", env.service);
    let scheduler = owner.scheduler();

    let stats_source = scheduler.clone();
    let _heartbeat = scheduler.schedule_at_fixed_rate(
        move || {
            let stats = stats_source.stats();
            tracing::info!(
                scheduler = %stats.name,
                current_pool_size = stats.current_pool_size,
                active_workers = stats.active_workers,
                pending_delayed = stats.pending_delayed,
                completed_tasks = stats.completed_tasks,
                "heartbeat"
            );
        },
        Duration::ZERO,
        heartbeat,
    )?;

    tokio::signal::ctrl_c().await?;
    eprintln!("Shutdown signal received, draining...");

    let timeout = env.shutdown_timeout;
    let result = tokio::task::spawn_blocking(move || owner.dispose_and_wait(timeout)).await?;
    match result {
        ShutdownResult::Complete => eprintln!("Shutdown complete"),
        ShutdownResult::Timeout {
            pending_delayed,
            active_workers,
        } => {
            eprintln!(
                "Shutdown timeout, {pending_delayed} delayed tasks and {active_workers} running tasks remaining"
            );
        }
    }
    Ok(())
}
