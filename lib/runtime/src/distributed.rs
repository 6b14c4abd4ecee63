// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The [`DistributedContext`] owns group membership for one process.
//!
//! A context starts out inactive, where it reports rank 0 of a group of one and every
//! collective built on it is the identity. [`DistributedContext::init`] joins a group
//! through the rendezvous endpoint; [`DistributedContext::teardown`] leaves it again.
//!
//! The context is passed explicitly to every component instead of living in a
//! process global, so a test can run several ranks side by side in one process.

use std::sync::Arc;

use parking_lot::RwLock;
use validator::Validate;

use crate::config::DistributedConfig;
use crate::device::DeviceId;
use crate::error::{DistError, Result};
use crate::transports::Transport;
use crate::transports::tcp::TcpTransport;

#[derive(Debug, Clone)]
struct GroupState {
    rank: usize,
    world_size: usize,
    device: DeviceId,
    /// `None` for a group of one: there is nobody to talk to.
    transport: Option<Arc<dyn Transport>>,
}

#[derive(Debug, Default)]
pub struct DistributedContext {
    state: RwLock<Option<GroupState>>,
}

impl DistributedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the group described by `config` and bind this process to its device,
    /// `device_ids[rank]` when given, else `rank`.
    ///
    /// Fails with [`DistError::Initialization`] when the context is already active,
    /// the configuration is invalid, or the rendezvous endpoint cannot be reached.
    /// A failed call leaves the context untouched.
    #[tracing::instrument(level = "debug", skip(self, config), fields(rank = config.rank, world_size = config.world_size))]
    pub async fn init(&self, config: &DistributedConfig) -> Result<DeviceId> {
        if self.is_active() {
            return Err(DistError::initialization("context is already initialized"));
        }
        config
            .validate()
            .map_err(|e| DistError::initialization(e.to_string()))?;
        let device = config.affinity().resolve(config.rank)?;

        let transport: Option<Arc<dyn Transport>> = if config.world_size > 1 {
            Some(Arc::new(TcpTransport::connect(config, device).await?))
        } else {
            None
        };

        self.install(
            GroupState {
                rank: config.rank,
                world_size: config.world_size,
                device,
                transport,
            },
        )
        .await
    }

    /// Join a group through an already connected transport.
    pub async fn init_with_transport(
        &self,
        transport: Arc<dyn Transport>,
        device: DeviceId,
    ) -> Result<DeviceId> {
        if self.is_active() {
            return Err(DistError::initialization("context is already initialized"));
        }
        let rank = transport.rank();
        let world_size = transport.world_size();
        if world_size == 0 || rank >= world_size {
            return Err(DistError::initialization(format!(
                "rank {rank} is invalid for world_size {world_size}"
            )));
        }

        self.install(GroupState {
            rank,
            world_size,
            device,
            transport: Some(transport),
        })
        .await
    }

    async fn install(&self, state: GroupState) -> Result<DeviceId> {
        let device = state.device;
        let rank = state.rank;
        let world_size = state.world_size;

        let lost_race = {
            let mut guard = self.state.write();
            if guard.is_some() {
                Some(state)
            } else {
                *guard = Some(state);
                None
            }
        };

        // Another init won while this one was connecting; undo ours.
        if let Some(state) = lost_race {
            if let Some(transport) = state.transport {
                transport.shutdown().await;
            }
            return Err(DistError::initialization("context is already initialized"));
        }

        tracing::info!(rank, world_size, %device, "joined distributed group");
        Ok(device)
    }

    pub fn is_active(&self) -> bool {
        self.state.read().is_some()
    }

    /// Number of processes in the group; 1 while inactive.
    pub fn world_size(&self) -> usize {
        self.state.read().as_ref().map_or(1, |s| s.world_size)
    }

    /// Rank of this process; 0 while inactive.
    pub fn rank(&self) -> usize {
        self.state.read().as_ref().map_or(0, |s| s.rank)
    }

    pub fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Device this process is bound to, if initialized.
    pub fn device(&self) -> Option<DeviceId> {
        self.state.read().as_ref().map(|s| s.device)
    }

    /// True when collectives have peers to talk to.
    pub fn is_distributed(&self) -> bool {
        self.transport().is_some()
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.state
            .read()
            .as_ref()
            .filter(|s| s.world_size > 1)
            .and_then(|s| s.transport.clone())
    }

    /// Wait until every rank has reached this barrier. No-op outside a group.
    ///
    /// `device_ids` are the devices the calling rank uses; they are never inferred
    /// from the rank.
    pub async fn barrier(&self, device_ids: &[DeviceId]) -> Result<()> {
        match self.transport() {
            Some(transport) => {
                tracing::debug!(rank = transport.rank(), ?device_ids, "entering barrier");
                transport.barrier(device_ids).await
            }
            None => Ok(()),
        }
    }

    /// Leave the group and release its resources. Safe to call any number of times,
    /// including on a context that was never initialized.
    pub async fn teardown(&self) {
        let state = self.state.write().take();
        if let Some(state) = state {
            if let Some(transport) = state.transport {
                transport.shutdown().await;
            }
            tracing::info!(rank = state.rank, "left distributed group");
        }
    }
}
