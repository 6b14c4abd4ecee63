// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP rendezvous transport.
//!
//! Rank 0 binds the rendezvous endpoint and runs a [`RendezvousServer`] task. Every
//! rank, rank 0 included, then connects to the endpoint as a client, retrying until
//! the configured connect timeout elapses, and introduces itself with its rank and
//! the world size it expects. Collectives are sent to the coordinator, which replies
//! once every rank has contributed.

mod codec;
mod server;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameCodec, FrameHeader};
pub use server::RendezvousServer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::{CollectiveOp, Transport};
use crate::config::DistributedConfig;
use crate::device::DeviceId;
use crate::error::{DistError, Result};

/// How long rank 0 lets the coordinator drain before cancelling it at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct ServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    conn: tokio::sync::Mutex<Framed<TcpStream, FrameCodec>>,
    seq: AtomicU64,
    closed: AtomicBool,
    server: parking_lot::Mutex<Option<ServerHandle>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpTransport {
    /// Join the group described by `config`. Any failure is an initialization error
    /// and leaves nothing running behind.
    pub async fn connect(config: &DistributedConfig, device: DeviceId) -> Result<Self> {
        let deadline = Instant::now() + config.connect_timeout();

        let server = if config.rank == 0 {
            let cancel = CancellationToken::new();
            let server =
                RendezvousServer::bind(&config.addr, config.port, config.world_size, cancel.clone())
                    .await?;
            tracing::debug!(addr = %config.endpoint(), "rendezvous endpoint bound");
            let task = tokio::spawn(server.serve());
            Some(ServerHandle { cancel, task })
        } else {
            None
        };

        match Self::join(config, device, deadline).await {
            Ok(conn) => Ok(Self {
                rank: config.rank,
                world_size: config.world_size,
                conn: tokio::sync::Mutex::new(conn),
                seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                server: parking_lot::Mutex::new(server),
            }),
            Err(e) => {
                if let Some(server) = server {
                    server.cancel.cancel();
                    server.task.abort();
                }
                Err(e)
            }
        }
    }

    async fn join(
        config: &DistributedConfig,
        device: DeviceId,
        deadline: Instant,
    ) -> Result<Framed<TcpStream, FrameCodec>> {
        let endpoint = config.endpoint();
        let unreachable = |detail: String| {
            DistError::initialization(format!(
                "rendezvous endpoint {endpoint} unreachable: {detail}"
            ))
        };

        let stream = loop {
            match tokio::time::timeout_at(deadline, TcpStream::connect(endpoint.as_str())).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => {
                    if Instant::now() + config.connect_retry_interval() >= deadline {
                        return Err(unreachable(e.to_string()));
                    }
                    tracing::trace!(rank = config.rank, "rendezvous not reachable yet: {}", e);
                    tokio::time::sleep(config.connect_retry_interval()).await;
                }
                Err(_) => return Err(unreachable("timed out".to_string())),
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut framed = Framed::new(stream, FrameCodec::default());
        framed
            .send(Frame::new(FrameHeader::Hello {
                rank: config.rank,
                world_size: config.world_size,
                device,
            }))
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        match tokio::time::timeout_at(deadline, framed.next()).await {
            Ok(Some(Ok(frame))) => match frame.header {
                FrameHeader::Welcome { world_size } if world_size == config.world_size => {
                    Ok(framed)
                }
                FrameHeader::Reject { reason } => Err(DistError::initialization(reason)),
                other => Err(DistError::initialization(format!(
                    "unexpected rendezvous reply {other:?}"
                ))),
            },
            Ok(Some(Err(e))) => Err(unreachable(e.to_string())),
            Ok(None) => Err(unreachable("connection closed during handshake".to_string())),
            Err(_) => Err(DistError::initialization(format!(
                "timed out waiting for {} ranks to join at {endpoint}",
                config.world_size
            ))),
        }
    }

    async fn exchange(
        &self,
        op: CollectiveOp,
        device_ids: Vec<DeviceId>,
        payload: Bytes,
    ) -> Result<Vec<Bytes>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DistError::NotInitialized);
        }

        let mut conn = self.conn.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        conn.send(Frame::with_payload(
            FrameHeader::Contribute {
                seq,
                op,
                device_ids,
            },
            payload,
        ))
        .await?;

        let frame = match conn.next().await {
            Some(frame) => frame?,
            None => return Err(DistError::transport("rendezvous connection closed")),
        };

        match frame.header {
            FrameHeader::Gathered { seq: got, lengths } if got == seq => {
                split_gathered(frame.payload, &lengths, self.world_size)
            }
            FrameHeader::Gathered { seq: got, .. } => Err(DistError::protocol(format!(
                "expected completion of collective #{seq}, got #{got}"
            ))),
            FrameHeader::Reject { reason } => Err(DistError::protocol(reason)),
            other => Err(DistError::protocol(format!("unexpected frame {other:?}"))),
        }
    }
}

fn split_gathered(payload: Bytes, lengths: &[usize], world_size: usize) -> Result<Vec<Bytes>> {
    if lengths.len() != world_size || lengths.iter().sum::<usize>() != payload.len() {
        return Err(DistError::protocol(format!(
            "gathered payload of {} bytes does not match lengths {lengths:?}",
            payload.len()
        )));
    }
    let mut offset = 0;
    Ok(lengths
        .iter()
        .map(|len| {
            let part = payload.slice(offset..offset + len);
            offset += len;
            part
        })
        .collect())
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_gather(&self, payload: Bytes) -> Result<Vec<Bytes>> {
        self.exchange(CollectiveOp::AllGather, Vec::new(), payload)
            .await
    }

    async fn barrier(&self, device_ids: &[DeviceId]) -> Result<()> {
        self.exchange(CollectiveOp::Barrier, device_ids.to_vec(), Bytes::new())
            .await?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut conn = self.conn.lock().await;
            let goodbye = Frame::new(FrameHeader::Goodbye { rank: self.rank });
            if let Err(e) = conn.send(goodbye).await {
                tracing::debug!(rank = self.rank, "goodbye not delivered: {}", e);
            }
        }

        let server = self.server.lock().take();
        if let Some(mut server) = server {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server.task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::warn!("rendezvous coordinator failed: {}", e),
                Ok(Err(e)) => tracing::warn!("rendezvous coordinator panicked: {}", e),
                Err(_) => {
                    tracing::debug!("rendezvous coordinator still draining, cancelling");
                    server.cancel.cancel();
                    server.task.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_gathered_by_lengths() {
        let parts = split_gathered(Bytes::from_static(b"aabccc"), &[2, 1, 3], 3).unwrap();
        assert_eq!(parts, vec![
            Bytes::from_static(b"aa"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"ccc"),
        ]);
    }

    #[test]
    fn test_split_gathered_rejects_bad_lengths() {
        assert!(split_gathered(Bytes::from_static(b"abc"), &[1, 1], 2).is_err());
        assert!(split_gathered(Bytes::from_static(b"abc"), &[3], 2).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_initialization_error() {
        // Nobody listens for rank 1; the connect loop gives up after the timeout.
        let mut config = DistributedConfig::new(1, 2).with_endpoint("127.0.0.1", 1);
        config.connect_timeout_secs = 1;
        config.connect_retry_interval_ms = 50;

        let err = TcpTransport::connect(&config, DeviceId::new(1))
            .await
            .unwrap_err();
        assert!(err.is_initialization(), "{err:?}");
    }
}
