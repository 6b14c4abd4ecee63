// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group transports.
//!
//! A [`Transport`] is the only thing in this crate that talks to peers. It offers
//! two collectives, all-gather and barrier, and nothing else. Every member of the
//! group must issue the same sequence of collectives; a rank that skips or reorders
//! a call leaves its peers waiting forever.
//!
//! - [`memory::MemoryTransport`]: in-process group used to simulate N ranks in one test.
//! - [`tcp::TcpTransport`]: rendezvous over TCP, rank 0 hosts the coordinator.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::Result;

pub mod memory;
pub mod tcp;

/// Kind of collective a rank issued at a given position in the call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveOp {
    AllGather,
    Barrier,
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Exchange `payload` with every peer. Element `i` of the result is the payload
    /// rank `i` contributed, independent of arrival order.
    async fn all_gather(&self, payload: Bytes) -> Result<Vec<Bytes>>;

    /// Resolve once every rank has entered the barrier. `device_ids` are the devices
    /// the calling rank uses, carried along so coordination metadata stays on them.
    async fn barrier(&self, device_ids: &[DeviceId]) -> Result<()>;

    /// Release group resources. Best-effort, never fails, safe to repeat.
    async fn shutdown(&self);
}
