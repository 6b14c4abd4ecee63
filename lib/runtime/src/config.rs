// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bootstrap configuration for a distributed group.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from the `LOCKSTEP_CONFIG_PATH` environment variable
//! 3. Launcher environment: `WORLD_SIZE`, `RANK` (or `LOCAL_RANK`), `MASTER_ADDR`, `MASTER_PORT`
//! 4. `LOCKSTEP_*` prefixed environment variables, e.g. `LOCKSTEP_DEVICE_IDS=[1,0]`

use std::time::Duration;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::device::DeviceAffinity;

/// ENV pointing at an optional TOML configuration file
const CONFIG_PATH_ENV: &str = "LOCKSTEP_CONFIG_PATH";

/// Prefix for crate-specific overrides
const ENV_PREFIX: &str = "LOCKSTEP_";

pub const DEFAULT_ADDR: &str = "localhost";
pub const DEFAULT_PORT: u16 = 12345;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Parameters consumed when joining a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_group"))]
pub struct DistributedConfig {
    /// Rank of this process, in `[0, world_size)`.
    pub rank: usize,

    /// Number of processes in the group.
    #[validate(range(min = 1))]
    pub world_size: usize,

    /// Rendezvous host. Rank 0 listens here, everyone else connects.
    #[validate(length(min = 1))]
    pub addr: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// Device per rank. When unset rank `r` uses device `r`.
    #[serde(default)]
    pub device_ids: Option<Vec<usize>>,

    /// How long to keep retrying the rendezvous endpoint.
    #[validate(range(min = 1))]
    pub connect_timeout_secs: u64,

    pub connect_retry_interval_ms: u64,
}

fn validate_group(config: &DistributedConfig) -> Result<(), ValidationError> {
    if config.rank >= config.world_size {
        let mut err = ValidationError::new("rank_out_of_range");
        err.message = Some(
            format!(
                "rank {} is invalid for world_size {}",
                config.rank, config.world_size
            )
            .into(),
        );
        return Err(err);
    }
    if let Some(ids) = &config.device_ids {
        if ids.len() < config.world_size {
            let mut err = ValidationError::new("device_ids_too_short");
            err.message = Some(
                format!(
                    "{} device ids given for world_size {}",
                    ids.len(),
                    config.world_size
                )
                .into(),
            );
            return Err(err);
        }
    }
    Ok(())
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            addr: DEFAULT_ADDR.to_string(),
            port: DEFAULT_PORT,
            device_ids: None,
            connect_timeout_secs: 30,
            connect_retry_interval_ms: 100,
        }
    }
}

impl DistributedConfig {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size,
            ..Default::default()
        }
    }

    /// A group of one. Every collective short-circuits to identity.
    pub fn single_process() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.addr = addr.into();
        self.port = port;
        self
    }

    pub fn with_device_ids(mut self, device_ids: Vec<usize>) -> Self {
        self.device_ids = Some(device_ids);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn affinity(&self) -> DeviceAffinity {
        match &self.device_ids {
            Some(ids) => DeviceAffinity::explicit(ids.iter().copied()),
            None => DeviceAffinity::identity(),
        }
    }

    /// `host:port` of the rendezvous endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(DistributedConfig::default()))
            .merge(Toml::file(&config_path))
            // LOCAL_RANK only counts when the launcher does not export RANK
            .merge(Env::raw().only(&["LOCAL_RANK"]).map(|_| "rank".into()))
            .merge(
                Env::raw()
                    .only(&["WORLD_SIZE", "RANK", "MASTER_ADDR", "MASTER_PORT"])
                    .map(|key| launcher_key(key.as_str()).into()),
            )
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load configuration from the default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider and validate it.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

fn launcher_key(key: &str) -> String {
    if key.eq_ignore_ascii_case("MASTER_ADDR") {
        "addr".to_string()
    } else if key.eq_ignore_ascii_case("MASTER_PORT") {
        "port".to_string()
    } else {
        key.to_ascii_lowercase()
    }
}

/// What the process launcher says about this process, read before any device
/// is touched so the caller can restrict device visibility first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchEnv {
    pub world_size: usize,
    pub local_rank: usize,
}

impl LaunchEnv {
    pub fn from_env() -> Self {
        let read = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            world_size: read("WORLD_SIZE", 1).max(1),
            local_rank: read("LOCAL_RANK", 0),
        }
    }

    pub fn is_multi_process(&self) -> bool {
        self.world_size > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ENV_VARS: &[&str] = &[
        "LOCKSTEP_CONFIG_PATH",
        "LOCKSTEP_PORT",
        "LOCKSTEP_DEVICE_IDS",
        "WORLD_SIZE",
        "RANK",
        "LOCAL_RANK",
        "MASTER_ADDR",
        "MASTER_PORT",
    ];

    /// Run `f` with exactly `vars` set among the variables this module reads.
    fn with_env(vars: &[(&str, &str)], f: impl FnOnce()) {
        let mut env: Vec<(&str, Option<&str>)> = ENV_VARS.iter().map(|k| (*k, None)).collect();
        for (key, value) in vars {
            match env.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = Some(*value),
                None => env.push((*key, Some(*value))),
            }
        }
        temp_env::with_vars(env, f);
    }

    #[test]
    fn test_default_config() {
        let config = DistributedConfig::default();
        assert_eq!(config.rank, 0);
        assert_eq!(config.world_size, 1);
        assert_eq!(config.endpoint(), "localhost:12345");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rank_must_be_below_world_size() {
        let config = DistributedConfig::new(2, 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_ids_must_cover_group() {
        let config = DistributedConfig::new(0, 3).with_device_ids(vec![0, 1]);
        assert!(config.validate().is_err());

        let config = DistributedConfig::new(0, 2).with_device_ids(vec![1, 0]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_figment_defaults() {
        with_env(&[], || {
            let config = DistributedConfig::from_env().unwrap();
            assert_eq!(config, DistributedConfig::single_process());
        });
    }

    #[test]
    fn test_launcher_env() {
        with_env(
            &[
                ("WORLD_SIZE", "4"),
                ("RANK", "3"),
                ("MASTER_ADDR", "10.0.0.7"),
                ("MASTER_PORT", "29500"),
            ],
            || {
                let config = DistributedConfig::from_env().unwrap();
                assert_eq!(config.world_size, 4);
                assert_eq!(config.rank, 3);
                assert_eq!(config.endpoint(), "10.0.0.7:29500");
            },
        );
    }

    #[test]
    fn test_local_rank_fallback() {
        with_env(&[("WORLD_SIZE", "2"), ("LOCAL_RANK", "1")], || {
            let config = DistributedConfig::from_env().unwrap();
            assert_eq!(config.rank, 1);
        });
    }

    #[test]
    fn test_toml_then_prefixed_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            world_size = 2
            rank = 1
            port = 4000
            device_ids = [1, 0]
            "#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        with_env(
            &[("LOCKSTEP_CONFIG_PATH", path.as_str()), ("LOCKSTEP_PORT", "4100")],
            || {
                let config = DistributedConfig::from_env().unwrap();
                assert_eq!(config.port, 4100);
                assert_eq!(config.device_ids, Some(vec![1, 0]));
                assert_eq!(config.affinity().resolve(1).unwrap(), crate::DeviceId::new(0));
            },
        );
    }

    #[test]
    fn test_extract_from_with_tuple_override() {
        with_env(&[], || {
            let figment = DistributedConfig::figment()
                .merge(("world_size", 3usize))
                .merge(("rank", 2usize));
            let config = DistributedConfig::extract_from(figment).unwrap();
            assert_eq!(config.rank, 2);
            assert_eq!(config.world_size, 3);
        });
    }

    #[test]
    fn test_invalid_env_fails_validation() {
        with_env(&[("WORLD_SIZE", "2"), ("RANK", "5")], || {
            let result = DistributedConfig::from_env();
            assert!(matches!(result, Err(ConfigError::Validation(_))));
        });
    }

    #[test]
    fn test_launch_env() {
        with_env(&[("WORLD_SIZE", "8"), ("LOCAL_RANK", "5")], || {
            let launch = LaunchEnv::from_env();
            assert!(launch.is_multi_process());
            assert_eq!(launch.local_rank, 5);
        });
        with_env(&[], || {
            assert_eq!(
                LaunchEnv::from_env(),
                LaunchEnv {
                    world_size: 1,
                    local_rank: 0
                }
            );
        });
    }
}
