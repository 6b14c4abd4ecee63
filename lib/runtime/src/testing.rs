// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Helpers for exercising multi-rank code inside a single test process.

use std::sync::Arc;

use crate::device::DeviceId;
use crate::distributed::DistributedContext;
use crate::error::Result;
use crate::transports::Transport;
use crate::transports::memory::MemoryTransport;

/// Build `world_size` initialized contexts sharing an in-memory transport.
///
/// Element `r` is rank `r`, bound to device `r`. Each context is meant to be moved
/// into its own task; driving two ranks from one task deadlocks on the first
/// collective.
pub async fn local_group(world_size: usize) -> Result<Vec<Arc<DistributedContext>>> {
    let mut contexts = Vec::with_capacity(world_size);
    for transport in MemoryTransport::group(world_size) {
        let ctx = Arc::new(DistributedContext::new());
        let device = DeviceId::new(transport.rank());
        ctx.init_with_transport(Arc::new(transport), device).await?;
        contexts.push(ctx);
    }
    Ok(contexts)
}
