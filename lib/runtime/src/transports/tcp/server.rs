// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous coordinator hosted by rank 0.
//!
//! Two phases:
//! 1. Membership: accept connections until every rank in `[0, world_size)` has sent a
//!    valid `Hello`, then send `Welcome` to all of them.
//! 2. Collectives: collect one `Contribute` per rank for each sequence number and
//!    answer every rank with all contributions in ascending rank order.
//!
//! The coordinator stops once every rank said goodbye, when the cancellation token
//! fires, or after telling the survivors that a peer vanished mid-run.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::codec::{Frame, FrameCodec, FrameHeader};
use crate::error::{DistError, Result};
use crate::transports::CollectiveOp;

/// How long a fresh connection may take to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type PeerSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type PeerStream = SplitStream<Framed<TcpStream, FrameCodec>>;

#[derive(Debug)]
enum PeerEvent {
    Frame(usize, Frame),
    Closed(usize),
}

#[derive(Debug)]
struct PendingRound {
    op: CollectiveOp,
    slots: Vec<Option<Bytes>>,
}

impl PendingRound {
    fn new(op: CollectiveOp, world_size: usize) -> Self {
        Self {
            op,
            slots: vec![None; world_size],
        }
    }

    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Concatenate contributions in rank order.
    fn into_frame(self, seq: u64) -> Frame {
        let parts: Vec<Bytes> = self.slots.into_iter().flatten().collect();
        let lengths = parts.iter().map(Bytes::len).collect();
        let mut payload = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in &parts {
            payload.extend_from_slice(part);
        }
        Frame::with_payload(FrameHeader::Gathered { seq, lengths }, payload.freeze())
    }
}

pub struct RendezvousServer {
    listener: TcpListener,
    world_size: usize,
    cancel: CancellationToken,
}

impl RendezvousServer {
    /// Bind the rendezvous endpoint.
    pub async fn bind(
        addr: &str,
        port: u16,
        world_size: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind((addr, port)).await.map_err(|e| {
            DistError::initialization(format!(
                "failed to bind rendezvous endpoint {addr}:{port}: {e}"
            ))
        })?;
        Ok(Self {
            listener,
            world_size,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        let cancel = self.cancel.clone();
        let peers = tokio::select! {
            peers = self.accept_group() => peers?,
            _ = cancel.cancelled() => {
                debug!("rendezvous cancelled before the group formed");
                return Ok(());
            }
        };
        info!(world_size = self.world_size, "rendezvous group formed");
        self.run_collectives(peers).await
    }

    async fn accept_group(&self) -> Result<Vec<Framed<TcpStream, FrameCodec>>> {
        let mut members: Vec<Option<Framed<TcpStream, FrameCodec>>> =
            (0..self.world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < self.world_size {
            let (stream, peer_addr) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY on {}: {}", peer_addr, e);
            }
            let mut framed = Framed::new(stream, FrameCodec::default());

            let hello = match tokio::time::timeout(HELLO_TIMEOUT, framed.next()).await {
                Ok(Some(Ok(frame))) => frame.header,
                Ok(Some(Err(e))) => {
                    warn!("bad hello from {}: {}", peer_addr, e);
                    continue;
                }
                Ok(None) | Err(_) => {
                    warn!("{} disconnected or stalled before hello", peer_addr);
                    continue;
                }
            };

            let rank = match self.admit(&hello, &members) {
                Ok(rank) => rank,
                Err(reason) => {
                    warn!(%peer_addr, %reason, "rejecting rendezvous member");
                    let _ = framed.send(Frame::new(FrameHeader::Reject { reason })).await;
                    continue;
                }
            };

            debug!(rank, %peer_addr, "rank joined rendezvous");
            members[rank] = Some(framed);
            joined += 1;
        }

        let mut peers = Vec::with_capacity(self.world_size);
        for mut framed in members.into_iter().flatten() {
            framed
                .send(Frame::new(FrameHeader::Welcome {
                    world_size: self.world_size,
                }))
                .await?;
            peers.push(framed);
        }
        Ok(peers)
    }

    fn admit(
        &self,
        hello: &FrameHeader,
        members: &[Option<Framed<TcpStream, FrameCodec>>],
    ) -> std::result::Result<usize, String> {
        match hello {
            FrameHeader::Hello {
                rank, world_size, ..
            } => {
                if *world_size != self.world_size {
                    Err(format!(
                        "rank {rank} expects world_size {world_size}, the group has {}",
                        self.world_size
                    ))
                } else if *rank >= self.world_size {
                    Err(format!(
                        "rank {rank} is invalid for world_size {}",
                        self.world_size
                    ))
                } else if members[*rank].is_some() {
                    Err(format!("rank {rank} already joined the group"))
                } else {
                    Ok(*rank)
                }
            }
            other => Err(format!("expected hello, got {other:?}")),
        }
    }

    async fn run_collectives(&self, peers: Vec<Framed<TcpStream, FrameCodec>>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sinks: Vec<Option<PeerSink>> = Vec::with_capacity(peers.len());

        for (rank, framed) in peers.into_iter().enumerate() {
            let (sink, stream) = framed.split();
            sinks.push(Some(sink));
            tokio::spawn(forward_frames(rank, stream, tx.clone()));
        }
        drop(tx);

        let mut pending: HashMap<u64, PendingRound> = HashMap::new();
        let mut departed = vec![false; self.world_size];

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("rendezvous cancelled");
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                PeerEvent::Frame(rank, frame) => match frame.header {
                    FrameHeader::Contribute {
                        seq,
                        op,
                        device_ids,
                    } => {
                        trace!(rank, seq, ?op, ?device_ids, "contribution");
                        let round = pending
                            .entry(seq)
                            .or_insert_with(|| PendingRound::new(op, self.world_size));
                        if round.op != op {
                            let reason = format!(
                                "rank {rank} issued {op:?} as collective #{seq}, a peer issued {:?}",
                                round.op
                            );
                            send_to(&mut sinks, rank, Frame::new(FrameHeader::Reject { reason }))
                                .await;
                            continue;
                        }
                        round.slots[rank] = Some(frame.payload);
                        if round.is_complete() {
                            if let Some(round) = pending.remove(&seq) {
                                let reply = round.into_frame(seq);
                                for rank in 0..sinks.len() {
                                    send_to(&mut sinks, rank, reply.clone()).await;
                                }
                            }
                        }
                    }
                    FrameHeader::Goodbye { .. } => {
                        debug!(rank, "rank left the group");
                        departed[rank] = true;
                        if departed.iter().all(|d| *d) {
                            break;
                        }
                    }
                    other => warn!(rank, ?other, "unexpected frame"),
                },
                PeerEvent::Closed(rank) => {
                    if departed[rank] {
                        continue;
                    }
                    departed[rank] = true;
                    if !pending.is_empty() {
                        warn!(rank, "rank disconnected with collectives in flight");
                        let reason = format!("rank {rank} disconnected from the group");
                        for peer in 0..sinks.len() {
                            send_to(
                                &mut sinks,
                                peer,
                                Frame::new(FrameHeader::Reject {
                                    reason: reason.clone(),
                                }),
                            )
                            .await;
                        }
                        break;
                    }
                    debug!(rank, "rank disconnected");
                    if departed.iter().all(|d| *d) {
                        break;
                    }
                }
            }
        }

        info!("rendezvous coordinator stopped");
        Ok(())
    }
}

async fn forward_frames(rank: usize, mut stream: PeerStream, tx: mpsc::UnboundedSender<PeerEvent>) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(frame) => {
                if tx.send(PeerEvent::Frame(rank, frame)).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(rank, "error reading from rank: {}", e);
                break;
            }
        }
    }
    let _ = tx.send(PeerEvent::Closed(rank));
}

async fn send_to(sinks: &mut [Option<PeerSink>], rank: usize, frame: Frame) {
    if let Some(sink) = sinks[rank].as_mut() {
        if let Err(e) = sink.send(frame).await {
            warn!(rank, "failed to send to rank: {}", e);
            sinks[rank] = None;
        }
    }
}
