// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rank to compute-device affinity.
//!
//! Each rank exclusively owns one local compute device. The mapping is either the
//! identity (`rank -> rank`) or an explicit per-rank list handed in at startup,
//! e.g. when a launcher restricts visible devices and every process sees its
//! device as index 0.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DistError, Result};

/// Index of a local compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(usize);

impl DeviceId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

impl From<usize> for DeviceId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Resolves which device a rank binds to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAffinity {
    device_ids: Option<Vec<DeviceId>>,
}

impl DeviceAffinity {
    /// Identity mapping: rank `r` uses device `r`.
    pub fn identity() -> Self {
        Self { device_ids: None }
    }

    pub fn explicit(device_ids: impl IntoIterator<Item = impl Into<DeviceId>>) -> Self {
        Self {
            device_ids: Some(device_ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Device for `rank`: `device_ids[rank]` when a list was given, else `rank`.
    pub fn resolve(&self, rank: usize) -> Result<DeviceId> {
        match &self.device_ids {
            None => Ok(DeviceId(rank)),
            Some(ids) => ids.get(rank).copied().ok_or_else(|| {
                DistError::initialization(format!(
                    "no device id for rank {rank}, only {} device ids were given",
                    ids.len()
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_affinity() {
        let affinity = DeviceAffinity::identity();
        assert_eq!(affinity.resolve(0).unwrap(), DeviceId::new(0));
        assert_eq!(affinity.resolve(3).unwrap(), DeviceId::new(3));
    }

    #[test]
    fn test_explicit_affinity() {
        let affinity = DeviceAffinity::explicit([2usize, 0, 1]);
        assert_eq!(affinity.resolve(0).unwrap(), DeviceId::new(2));
        assert_eq!(affinity.resolve(2).unwrap(), DeviceId::new(1));
    }

    #[test]
    fn test_explicit_affinity_out_of_range() {
        let affinity = DeviceAffinity::explicit([0usize]);
        let err = affinity.resolve(1).unwrap_err();
        assert!(err.is_initialization());
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceId::new(4).to_string(), "device:4");
    }
}
