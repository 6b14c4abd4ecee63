// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod leader_first;

pub use leader_first::{leader_first, LeaderFirstOptions, LeaderFirstOptionsBuilder};
