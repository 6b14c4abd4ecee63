// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lockstep
//!
//! Process-group coordination for data-parallel training: join a group, gather and
//! reduce numeric buffers across ranks, synchronize flat and nested metrics, and run
//! one-time work on the leader before the rest of the group.
//!
//! Every operation also works without a group. An uninitialized
//! [`DistributedContext`] behaves as rank 0 of a group of one, barriers return
//! immediately, and every collective returns its input unchanged.
//!
//! ```no_run
//! # async fn run() -> lockstep_runtime::Result<()> {
//! use std::sync::Arc;
//! use lockstep_runtime::{
//!     CollectiveReducer, DistError, DistributedConfig, DistributedContext, MetricMap,
//!     MetricSynchronizer, ValueSynchronizer,
//! };
//!
//! let config = DistributedConfig::from_env()
//!     .map_err(|e| DistError::initialization(e.to_string()))?;
//! let ctx = Arc::new(DistributedContext::new());
//! let device = ctx.init(&config).await?;
//!
//! let metrics = MetricSynchronizer::new(ValueSynchronizer::new(CollectiveReducer::new(
//!     ctx.clone(),
//! )));
//! let epoch = MetricMap::new().with("loss", MetricMap::new().with("train", 0.42));
//! let synced = metrics.sync(epoch, device, "mean").await?;
//! # let _ = synced;
//! ctx.teardown().await;
//! # Ok(())
//! # }
//! ```

pub mod collective;
pub mod config;
pub mod device;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod sync;
pub mod testing;
pub mod transports;
pub mod utils;

pub use collective::{Buffer, CollectiveReducer, IntoReduction, ReductionMode};
pub use config::{ConfigError, DistributedConfig, LaunchEnv};
pub use device::{DeviceAffinity, DeviceId};
pub use distributed::DistributedContext;
pub use error::{DistError, Result};
pub use sync::{
    Metric, MetricMap, MetricPath, MetricSynchronizer, SyncedValues, ValueSynchronizer,
};
pub use transports::Transport;
pub use utils::{LeaderFirstOptions, LeaderFirstOptionsBuilder, leader_first};
