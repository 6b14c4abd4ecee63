// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::collective::{Buffer, CollectiveReducer, IntoReduction, ReductionMode};
use crate::device::DeviceId;
use crate::error::Result;

/// Result of synchronizing a flat list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncedValues {
    /// One value per position: the mean or sum across ranks, or the untouched
    /// input outside a group.
    Reduced(Vec<f64>),
    /// One row per rank, in rank order.
    Stacked(Vec<Vec<f64>>),
}

impl SyncedValues {
    pub fn as_reduced(&self) -> Option<&[f64]> {
        match self {
            Self::Reduced(values) => Some(values),
            Self::Stacked(_) => None,
        }
    }

    pub fn into_reduced(self) -> Option<Vec<f64>> {
        match self {
            Self::Reduced(values) => Some(values),
            Self::Stacked(_) => None,
        }
    }

    pub fn into_stacked(self) -> Option<Vec<Vec<f64>>> {
        match self {
            Self::Stacked(rows) => Some(rows),
            Self::Reduced(_) => None,
        }
    }
}

/// Synchronizes an ordered list of numbers across the group.
///
/// Position is the contract: element `i` on this rank is combined with element `i`
/// of every peer, so callers must build `values` in an order the whole group agrees
/// on.
#[derive(Debug, Clone)]
pub struct ValueSynchronizer {
    reducer: CollectiveReducer,
}

impl ValueSynchronizer {
    pub fn new(reducer: CollectiveReducer) -> Self {
        Self { reducer }
    }

    pub fn reducer(&self) -> &CollectiveReducer {
        &self.reducer
    }

    pub async fn sync(
        &self,
        values: Vec<f64>,
        device: DeviceId,
        mode: impl IntoReduction,
    ) -> Result<SyncedValues> {
        let mode = mode.into_reduction()?;
        if !self.reducer.context().is_distributed() {
            return Ok(SyncedValues::Reduced(values));
        }

        let buffer = Buffer::from_values(values, device);
        let synced = self.reducer.all_gather_reduce(buffer, mode).await?;

        Ok(match mode {
            ReductionMode::Stacked => {
                SyncedValues::Stacked(synced.rows().map(<[f64]>::to_vec).collect())
            }
            ReductionMode::Mean | ReductionMode::Sum => SyncedValues::Reduced(synced.into_vec()),
        })
    }
}
