// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Value and metric synchronization on top of [`crate::collective::CollectiveReducer`].
//!
//! Both synchronizers are pure data shaping around one all-gather; they add no
//! communication of their own.

mod nested;
mod values;

pub use nested::{Metric, MetricMap, MetricPath, MetricSynchronizer};
pub use values::{SyncedValues, ValueSynchronizer};
