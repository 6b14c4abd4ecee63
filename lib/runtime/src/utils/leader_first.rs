// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Run a block of work on the leader before everybody else.
//!
//! The usual case is a one-time side effect such as downloading a dataset into a
//! shared cache: rank 0 does it while the followers wait, then the followers run the
//! same block and find the work already done.
//!
//! ```text
//!   rank 0:  body ── barrier ──────────────── [barrier]
//!   rank k:  barrier ─────────── body ─────── [barrier]
//! ```
//!
//! The trailing barrier (`join`) additionally holds every rank until the followers
//! are done too. Every rank of the group must enter the scope with the same
//! `enabled` and `join` values; otherwise the barrier counts diverge and the group
//! deadlocks.

use std::future::Future;

use derive_builder::Builder;

use crate::device::DeviceId;
use crate::distributed::DistributedContext;
use crate::error::{DistError, Result};

#[derive(Debug, Clone, Builder)]
#[builder(build_fn(error = "DistError"))]
pub struct LeaderFirstOptions {
    /// When false the scope runs its body immediately with no barriers.
    #[builder(default = "true")]
    pub enabled: bool,

    /// Hold every rank at a final barrier until all ranks have run the body.
    #[builder(default = "true")]
    pub join: bool,

    /// Devices this rank uses, forwarded to every barrier.
    pub device_ids: Vec<DeviceId>,
}

impl LeaderFirstOptions {
    pub fn builder() -> LeaderFirstOptionsBuilder {
        LeaderFirstOptionsBuilder::default()
    }
}

impl From<derive_builder::UninitializedFieldError> for DistError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        DistError::InvalidOptions {
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitForLeader,
    RunBody,
    SignalFollowers,
    Join,
}

/// Run `body` on rank 0 first and on every other rank after it.
///
/// Outside a group, or with `enabled` unset, `body` simply runs. An error from a
/// barrier is returned as is; an error inside `body` is the caller's `T` to carry.
pub async fn leader_first<F, Fut, T>(
    ctx: &DistributedContext,
    options: LeaderFirstOptions,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let gated = options.enabled && ctx.is_distributed();
    let leader = ctx.is_leader();
    let rank = ctx.rank();

    if gated && !leader {
        tracing::debug!(rank, phase = ?Phase::WaitForLeader, "leader_first");
        ctx.barrier(&options.device_ids).await?;
    }

    tracing::trace!(rank, phase = ?Phase::RunBody, "leader_first");
    let output = body().await;

    if gated && leader {
        tracing::debug!(rank, phase = ?Phase::SignalFollowers, "leader_first");
        ctx.barrier(&options.device_ids).await?;
    }

    if gated && options.join {
        tracing::debug!(rank, phase = ?Phase::Join, "leader_first");
        ctx.barrier(&options.device_ids).await?;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::local_group;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn options(enabled: bool, join: bool) -> LeaderFirstOptions {
        LeaderFirstOptions::builder()
            .enabled(enabled)
            .join(join)
            .device_ids(vec![DeviceId::new(0)])
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let opts = LeaderFirstOptions::builder()
            .device_ids(vec![DeviceId::new(1)])
            .build()
            .unwrap();
        assert!(opts.enabled);
        assert!(opts.join);
        assert_eq!(opts.device_ids, vec![DeviceId::new(1)]);
    }

    #[test]
    fn test_builder_requires_device_ids() {
        let err = LeaderFirstOptions::builder().build().unwrap_err();
        assert!(matches!(err, DistError::InvalidOptions { .. }));
    }

    #[tokio::test]
    async fn test_single_process_runs_body_once() {
        let ctx = DistributedContext::new();
        let calls = AtomicUsize::new(0);
        let out = leader_first(&ctx, options(true, true), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            42
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leader_finishes_before_followers_start() {
        let group = local_group(3).await.unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for ctx in group {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                leader_first(&ctx, options(true, true), || async {
                    if ctx.is_leader() {
                        // Give a follower that skipped the barrier time to show up.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    counter.fetch_add(1, Ordering::SeqCst)
                })
                .await
                .unwrap()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        // The leader's ticket is always the first one handed out.
        assert_eq!(seen[0], 0);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disabled_scope_skips_barriers() {
        let group = local_group(2).await.unwrap();

        // Only rank 1 enters the scope; with barriers enabled it would never return.
        let follower = group[1].clone();
        let out = tokio::time::timeout(
            Duration::from_secs(5),
            leader_first(&follower, options(false, true), || async { "ran" }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(out, "ran");
    }

    #[rstest::rstest]
    #[case(true)]
    #[case(false)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scope_keeps_group_in_step(#[case] join: bool) {
        let group = local_group(2).await.unwrap();

        let mut handles = Vec::new();
        for ctx in group {
            handles.push(tokio::spawn(async move {
                leader_first(&ctx, options(true, join), || async {}).await.unwrap();
                // A collective after the scope must still pair up across ranks.
                ctx.barrier(&[DeviceId::new(0)]).await.unwrap();
                ctx.rank()
            }));
        }

        let mut ranks = Vec::new();
        for handle in handles {
            ranks.push(handle.await.unwrap());
        }
        assert_eq!(ranks, vec![0, 1]);
    }
}
