//! GG Scheduler entry point.
//!
//! ## CLI Subcommands
//!
//! - `gg-scheduler-cli` or `gg-scheduler-cli serve` - Run a scheduler (default)
//! - `gg-scheduler-cli config show|defaults` - Print configuration as JSON
//! - `gg-scheduler-cli version` - Print the version

use std::process::ExitCode;

use gg_scheduler::cli::{config_cmd, serve};
use gg_scheduler::config as gg_config;
use gg_scheduler::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => {
            let heartbeat = match serve::parse_heartbeat(args.get(2..).unwrap_or(&[])) {
                Ok(heartbeat) => heartbeat,
                Err(e) => {
                    eprintln!("{}", e);
                    print_usage();
                    return ExitCode::FAILURE;
                }
            };

            let env = gg_config::load();
            if let Err(e) = telemetry::init_logging(&env.logging) {
                eprintln!("Logging setup failed: {}", e);
                return ExitCode::FAILURE;
            }
            telemetry::init_metrics();

            match serve::run(env, heartbeat).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Scheduler error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => ExitCode::from(config_cmd::run_show() as u8),
                "defaults" => ExitCode::from(config_cmd::run_defaults() as u8),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("gg-scheduler {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gg-scheduler-cli - delayed and periodic task scheduler v{}

USAGE:
    gg-scheduler-cli [COMMAND] [OPTIONS]

COMMANDS:
    serve        Run a scheduler until Ctrl-C, then drain (default)
    config       Print configuration (show, defaults) as JSON
    version      Show version information
    help         Show this help message

SERVE OPTIONS:
    --heartbeat-secs N   Seconds between heartbeat log lines (default: 30)

ENVIRONMENT:
    GG_SCHED_CORE_POOL_SIZE           Backend pool core size
    GG_SCHED_KEEP_ALIVE_SECS          Idle seconds before an excess worker retires
    GG_SCHED_THREAD_STACK_SIZE        Worker stack size in bytes (0 = default)
    GG_SCHED_PUMP_IDLE_MS             Idle milliseconds before the dispatcher exits
    GG_SCHED_TRANSFER_RETRIES         Failed pool hand-offs before a task is rejected
    GG_SCHED_TRANSFER_BACKOFF_MS      First hand-off retry delay
    GG_SCHED_RUN_DELAYED_ON_SHUTDOWN  Run (true) or cancel (false) delayed tasks on shutdown
    GG_SCHED_SHUTDOWN_TIMEOUT         Seconds to wait for the drain
    GG_SCHED_LOG_FORMAT               json, pretty or compact
    GG_SCHED_LOG_LEVEL                Tracing filter directives

EXIT CODES:
    0  Success
    1  Failure
",
        version
    );
}
