// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gather-and-reduce across the group.
//!
//! [`CollectiveReducer::all_gather_reduce`] is the only place numeric data crosses
//! process boundaries. Every rank ends up with the contributions of all ranks in
//! ascending rank order and applies the same reduction to them, so every rank gets
//! bit-identical results.
//!
//! # Synchronization
//!
//! This is a collective: every rank must call it exactly once per synchronization
//! point, in the same order relative to its other collectives. A rank that skips the
//! call leaves all of its peers waiting; nothing here detects that.

mod buffer;
mod reduction;

pub use buffer::Buffer;
pub use reduction::{IntoReduction, ReductionMode};

use std::sync::Arc;

use crate::distributed::DistributedContext;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CollectiveReducer {
    ctx: Arc<DistributedContext>,
}

impl CollectiveReducer {
    pub fn new(ctx: Arc<DistributedContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<DistributedContext> {
        &self.ctx
    }

    /// Gather `buffer` from every rank and combine the contributions with `mode`.
    ///
    /// The mode is validated before anything else, so an unsupported mode fails with
    /// [`crate::DistError::UnsupportedReduction`] even in a group of one. Outside a
    /// group the buffer comes back unchanged for every mode.
    ///
    /// With [`ReductionMode::Stacked`] the result has a leading dimension of
    /// `world_size` and slice `r` is exactly rank `r`'s contribution.
    pub async fn all_gather_reduce(
        &self,
        buffer: Buffer,
        mode: impl IntoReduction,
    ) -> Result<Buffer> {
        let mode = mode.into_reduction()?;

        let Some(transport) = self.ctx.transport() else {
            return Ok(buffer);
        };

        let device = buffer.device();
        tracing::trace!(
            rank = transport.rank(),
            world_size = transport.world_size(),
            %mode,
            shape = ?buffer.shape(),
            "all_gather_reduce"
        );

        let gathered = transport.all_gather(buffer.encode()).await?;
        let parts = gathered
            .into_iter()
            .map(|bytes| Buffer::decode(bytes, device))
            .collect::<Result<Vec<_>>>()?;

        reduce(&parts, mode, device)
    }
}

/// Combine per-rank contributions, `parts[r]` being rank `r`'s.
pub(crate) fn reduce(
    parts: &[Buffer],
    mode: ReductionMode,
    device: crate::device::DeviceId,
) -> Result<Buffer> {
    match mode {
        ReductionMode::Mean => Buffer::mean_of(parts, device),
        ReductionMode::Sum => Buffer::sum_of(parts, device),
        ReductionMode::Stacked => Buffer::stack(parts, device),
    }
}
