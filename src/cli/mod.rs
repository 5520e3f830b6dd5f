// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the scheduler binary.
//!
//! ## Usage
//!
//! ```bash
//! gg-scheduler-cli serve              # Run a scheduler until Ctrl-C
//! gg-scheduler-cli config show        # Effective configuration as JSON
//! gg-scheduler-cli config defaults    # Built-in defaults as JSON
//! ```

pub mod config_cmd;
pub mod serve;
