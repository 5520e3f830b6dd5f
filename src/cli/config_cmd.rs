// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults.
//!
//! Both read configuration directly from the environment; no scheduler is
//! started.

use crate::config::{self, EffectiveConfig, EnvConfig};

/// Print the effective config (env overrides applied) as JSON.
///
/// Returns the process exit code.
pub fn run_show() -> i32 {
    print_config(&config::load().effective_config())
}

/// Print the built-in defaults (no env overrides) as JSON.
pub fn run_defaults() -> i32 {
    print_config(&EnvConfig::default().effective_config())
}

fn print_config(cfg: &EffectiveConfig) -> i32 {
    match render(cfg) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            1
        }
    }
}

fn render(cfg: &EffectiveConfig) -> serde_json::Result<String> {
    serde_json::to_string_pretty(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_render_as_json_object() {
        let json = render(&EnvConfig::default().effective_config()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["keep_alive_secs"], 60);
        assert_eq!(value["pump_idle_ms"], 10_000);
        assert_eq!(value["log_level"], "gg_scheduler=info");
    }

    #[test]
    fn test_run_defaults_succeeds() {
        assert_eq!(run_defaults(), 0);
    }
}
