// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DistError, Result};

/// How gathered contributions are combined.
///
/// - `Mean`/`Sum`: one buffer of the original shape.
/// - `Stacked`: every contribution kept, ordered by rank, as a new leading dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionMode {
    Mean,
    Sum,
    #[serde(alias = "none")]
    Stacked,
}

impl Default for ReductionMode {
    fn default() -> Self {
        Self::Mean
    }
}

impl fmt::Display for ReductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Sum => write!(f, "sum"),
            Self::Stacked => write!(f, "none"),
        }
    }
}

impl FromStr for ReductionMode {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "sum" => Ok(Self::Sum),
            "none" | "stacked" => Ok(Self::Stacked),
            _ => Err(DistError::unsupported_reduction(s)),
        }
    }
}

/// Anything a collective accepts as its reduction argument.
///
/// Conversion happens as the first step of every collective, so a bad mode fails
/// the same way regardless of group size.
pub trait IntoReduction {
    fn into_reduction(self) -> Result<ReductionMode>;
}

impl IntoReduction for ReductionMode {
    fn into_reduction(self) -> Result<ReductionMode> {
        Ok(self)
    }
}

impl IntoReduction for &str {
    fn into_reduction(self) -> Result<ReductionMode> {
        self.parse()
    }
}

impl IntoReduction for String {
    fn into_reduction(self) -> Result<ReductionMode> {
        self.parse()
    }
}

impl IntoReduction for &String {
    fn into_reduction(self) -> Result<ReductionMode> {
        self.parse()
    }
}

/// `None` keeps every contribution.
impl IntoReduction for Option<&str> {
    fn into_reduction(self) -> Result<ReductionMode> {
        match self {
            Some(mode) => mode.parse(),
            None => Ok(ReductionMode::Stacked),
        }
    }
}
