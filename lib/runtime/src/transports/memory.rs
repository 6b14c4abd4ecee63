// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! All members of a group share one table of rounds keyed by call sequence number.
//! Each rank drops its contribution into the round for its next sequence number and
//! waits until every slot is filled. The last rank to collect a round removes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{CollectiveOp, Transport};
use crate::device::DeviceId;
use crate::error::{DistError, Result};

#[derive(Debug)]
struct Round {
    op: CollectiveOp,
    slots: Vec<Option<Bytes>>,
    collected: usize,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    rounds: Mutex<HashMap<u64, Round>>,
    notify: Notify,
}

/// One member of an in-process group.
#[derive(Debug)]
pub struct MemoryTransport {
    rank: usize,
    shared: Arc<Shared>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create every member of a group of `world_size`, ordered by rank.
    pub fn group(world_size: usize) -> Vec<MemoryTransport> {
        let shared = Arc::new(Shared {
            world_size,
            rounds: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });
        (0..world_size)
            .map(|rank| MemoryTransport {
                rank,
                shared: shared.clone(),
                seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            })
            .collect()
    }

    async fn exchange(&self, op: CollectiveOp, payload: Bytes) -> Result<Vec<Bytes>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DistError::NotInitialized);
        }

        let world_size = self.shared.world_size;
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);

        {
            let mut rounds = self.shared.rounds.lock();
            let round = rounds.entry(seq).or_insert_with(|| Round {
                op,
                slots: vec![None; world_size],
                collected: 0,
            });
            if round.op != op {
                return Err(DistError::protocol(format!(
                    "rank {} issued {:?} as collective #{seq}, a peer issued {:?}",
                    self.rank, op, round.op
                )));
            }
            round.slots[self.rank] = Some(payload);
        }
        self.shared.notify.notify_waiters();

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut rounds = self.shared.rounds.lock();
                if let Some(round) = rounds.get_mut(&seq) {
                    let gathered: Vec<Bytes> = round.slots.iter().flatten().cloned().collect();
                    if gathered.len() == world_size {
                        round.collected += 1;
                        if round.collected == world_size {
                            rounds.remove(&seq);
                        }
                        return Ok(gathered);
                    }
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    async fn all_gather(&self, payload: Bytes) -> Result<Vec<Bytes>> {
        self.exchange(CollectiveOp::AllGather, payload).await
    }

    async fn barrier(&self, device_ids: &[DeviceId]) -> Result<()> {
        tracing::trace!(rank = self.rank, ?device_ids, "memory barrier");
        self.exchange(CollectiveOp::Barrier, Bytes::new()).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
