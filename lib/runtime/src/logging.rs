// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lockstep Logging Module.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `LOCKSTEP_LOGGING_CONFIG_PATH` environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `LOCKSTEP_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters are read from the `LOCKSTEP_LOG` environment variable or from the `log_filters`
//! table of the TOML file. Only the leader logs at `info` by default; followers default to
//! `warn` so a group of N processes does not print every line N times.
//!
//! Example:
//! ```toml
//! log_level = "debug"
//!
//! [log_filters]
//! "lockstep_runtime::transports" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "LOCKSTEP_LOG";

/// ENV used to switch to JSON lines
const JSONL_ENV: &str = "LOCKSTEP_LOGGING_JSONL";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "LOCKSTEP_LOGGING_CONFIG_PATH";

/// Default log level on the leader
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Default log level on every other rank
const FOLLOWER_FILTER_LEVEL: &str = "warn";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

/// Initialize the logger as the leader would.
pub fn init() {
    init_for_rank(0);
}

/// Initialize the logger for `rank`. Non-leader ranks default to `warn` unless
/// `LOCKSTEP_LOG` says otherwise.
pub fn init_for_rank(rank: usize) {
    INIT.call_once(|| setup_logging(rank));
}

fn setup_logging(rank: usize) {
    let mut config = load_config();
    if rank != 0 {
        config.log_level = FOLLOWER_FILTER_LEVEL.to_string();
    }
    let filter_layer = filters(config);

    // Each builder method returns a specialized type, so both arms repeat the chain.
    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    } else {
        let l = fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    }
}

fn jsonl_logging_enabled() -> bool {
    std::env::var(JSONL_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| Directive::from(tracing::Level::INFO));

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config file
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path));

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Failed loading logging config, using defaults: {e}");
        LoggingConfig::default()
    })
}
