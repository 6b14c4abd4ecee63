// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous framing.
//!
//! Wire format:
//! - header_len: u32 (big-endian)
//! - header: JSON-encoded [`FrameHeader`]
//! - payload_len: u32 (big-endian)
//! - payload: bytes

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::{
    bytes::{BufMut, BytesMut},
    codec::{Decoder, Encoder},
};

use crate::device::DeviceId;
use crate::transports::CollectiveOp;

/// Frames larger than this are refused unless the codec is built with another limit.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameHeader {
    /// First frame on every connection.
    Hello {
        rank: usize,
        world_size: usize,
        device: DeviceId,
    },
    /// Sent to every rank once the whole group has said hello.
    Welcome { world_size: usize },
    /// One rank's part of collective number `seq`. The payload is the contribution.
    Contribute {
        seq: u64,
        op: CollectiveOp,
        device_ids: Vec<DeviceId>,
    },
    /// Completion of collective `seq`. The payload holds every contribution in rank
    /// order; `lengths[i]` is the byte length of rank `i`'s part.
    Gathered { seq: u64, lengths: Vec<usize> },
    /// The coordinator refused the connection or gave up on the group.
    Reject { reason: String },
    Goodbye { rank: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }
}

/// Codec for encoding/decoding [`Frame`]
#[derive(Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

fn invalid_data(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for header_len
        if src.len() < 4 {
            return Ok(None);
        }

        let header_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if src.len() < 4 + header_len + 4 {
            return Ok(None);
        }

        let payload_len_offset = 4 + header_len;
        let payload_len = u32::from_be_bytes([
            src[payload_len_offset],
            src[payload_len_offset + 1],
            src[payload_len_offset + 2],
            src[payload_len_offset + 3],
        ]) as usize;

        let total_len = 4 + header_len + 4 + payload_len;
        if total_len > self.max_frame_size {
            return Err(invalid_data(format!(
                "Frame too large: {} bytes (max: {} bytes)",
                total_len, self.max_frame_size
            )));
        }

        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let frame_bytes = src.split_to(total_len).freeze();
        let header: FrameHeader = serde_json::from_slice(&frame_bytes[4..4 + header_len])
            .map_err(|e| invalid_data(format!("Failed to deserialize frame header: {e}")))?;
        let payload_offset = 4 + header_len + 4;
        let payload = frame_bytes.slice(payload_offset..payload_offset + payload_len);

        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header_bytes = serde_json::to_vec(&item.header).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Failed to serialize frame header: {e}"),
            )
        })?;

        let total_len = 4 + header_bytes.len() + 4 + item.payload.len();
        if total_len > self.max_frame_size || item.payload.len() > u32::MAX as usize {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "Frame too large: {} bytes (max: {} bytes)",
                    total_len, self.max_frame_size
                ),
            ));
        }

        dst.reserve(total_len);
        dst.put_u32(header_bytes.len() as u32);
        dst.put_slice(&header_bytes);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::with_payload(
                    FrameHeader::Gathered {
                        seq: 7,
                        lengths: vec![2, 1],
                    },
                    Bytes::from_static(b"abc"),
                ),
                &mut buf,
            )
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(
            frame.header,
            FrameHeader::Gathered {
                seq: 7,
                lengths: vec![2, 1]
            }
        );
        assert_eq!(&frame.payload[..], b"abc");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(FrameHeader::Welcome { world_size: 2 }), &mut buf)
            .unwrap();
        codec
            .encode(Frame::new(FrameHeader::Goodbye { rank: 1 }), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header, FrameHeader::Welcome { world_size: 2 });
        assert_eq!(second.header, FrameHeader::Goodbye { rank: 1 });
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new(32);
        let mut buf = BytesMut::new();
        let result = codec.encode(
            Frame::with_payload(
                FrameHeader::Reject {
                    reason: "x".to_string(),
                },
                Bytes::from(vec![0u8; 64]),
            ),
            &mut buf,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_header_json_shape() {
        let header = FrameHeader::Contribute {
            seq: 3,
            op: CollectiveOp::Barrier,
            device_ids: vec![DeviceId::new(1)],
        };
        let json = serde_json::to_string(&header).unwrap();
        assert_eq!(
            json,
            r#"{"type":"contribute","seq":3,"op":"barrier","device_ids":[1]}"#
        );
    }
}
