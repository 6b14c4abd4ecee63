// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The leader's side effects are visible to every follower inside the scope.

use std::path::PathBuf;
use std::time::Duration;

use lockstep_runtime::testing::local_group;
use lockstep_runtime::{DeviceId, LeaderFirstOptions, leader_first};

#[derive(Debug, PartialEq)]
enum Outcome {
    Created,
    Found,
}

/// Create `marker` unless it already exists, the way a dataset download checks
/// its cache.
async fn prepare(marker: PathBuf, slow: bool) -> Outcome {
    if marker.exists() {
        return Outcome::Found;
    }
    if slow {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    std::fs::write(&marker, b"ready").unwrap();
    Outcome::Created
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_see_leader_marker() {
    for run in 0..10 {
        let dir = tempfile::tempdir().unwrap();
        let group = local_group(2).await.unwrap();

        let handles: Vec<_> = group
            .into_iter()
            .map(|ctx| {
                let marker = dir.path().join(format!("marker-{run}"));
                tokio::spawn(async move {
                    let options = LeaderFirstOptions::builder()
                        .device_ids(vec![DeviceId::new(ctx.rank())])
                        .build()
                        .unwrap();
                    let slow = ctx.is_leader();
                    let outcome = leader_first(&ctx, options, || prepare(marker, slow))
                        .await
                        .unwrap();
                    (ctx.rank(), outcome)
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        assert_eq!(
            outcomes,
            vec![(0, Outcome::Created), (1, Outcome::Found)],
            "run {run}"
        );
    }
}
