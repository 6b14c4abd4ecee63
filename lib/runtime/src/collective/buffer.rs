// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-shape numeric buffer, the unit of exchange for collectives.
//!
//! Wire format (little-endian):
//! - ndim: u32
//! - dims: ndim x u64
//! - data: product(dims) x f64

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::device::DeviceId;
use crate::error::{DistError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    device: DeviceId,
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Buffer {
    /// One-dimensional buffer holding `values` on `device`.
    pub fn from_values(values: impl Into<Vec<f64>>, device: DeviceId) -> Self {
        let data = values.into();
        Self {
            device,
            shape: vec![data.len()],
            data,
        }
    }

    pub fn with_shape(
        data: impl Into<Vec<f64>>,
        shape: impl Into<Vec<usize>>,
        device: DeviceId,
    ) -> Result<Self> {
        let data = data.into();
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DistError::InvalidOptions {
                reason: format!(
                    "shape {:?} holds {} elements but {} were given",
                    shape,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self {
            device,
            shape,
            data,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Rows along the leading dimension.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        let row_len = self.shape.iter().skip(1).product::<usize>();
        let rows = self.shape.first().copied().unwrap_or(0);
        (0..rows).map(move |i| &self.data[i * row_len..(i + 1) * row_len])
    }

    /// Stack `parts` into one buffer with a new leading dimension of `parts.len()`.
    /// Part `i` becomes slice `i`.
    pub fn stack(parts: &[Buffer], device: DeviceId) -> Result<Self> {
        let inner = match parts.first() {
            Some(first) => first.shape.clone(),
            None => {
                return Err(DistError::InvalidOptions {
                    reason: "cannot stack zero buffers".to_string(),
                });
            }
        };
        check_shapes(parts, &inner)?;

        let mut shape = Vec::with_capacity(inner.len() + 1);
        shape.push(parts.len());
        shape.extend_from_slice(&inner);

        let mut data = Vec::with_capacity(parts.iter().map(Buffer::len).sum());
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        Ok(Self {
            device,
            shape,
            data,
        })
    }

    /// Elementwise sum of `parts`, accumulated in slice order.
    pub fn sum_of(parts: &[Buffer], device: DeviceId) -> Result<Self> {
        let first = parts.first().ok_or_else(|| DistError::InvalidOptions {
            reason: "cannot reduce zero buffers".to_string(),
        })?;
        check_shapes(parts, &first.shape)?;

        let mut acc = vec![0.0f64; first.len()];
        for part in parts {
            for (a, v) in acc.iter_mut().zip(&part.data) {
                *a += *v;
            }
        }
        Ok(Self {
            device,
            shape: first.shape.clone(),
            data: acc,
        })
    }

    /// Elementwise arithmetic mean of `parts`.
    pub fn mean_of(parts: &[Buffer], device: DeviceId) -> Result<Self> {
        let mut sum = Self::sum_of(parts, device)?;
        let n = parts.len() as f64;
        for v in sum.data.iter_mut() {
            *v /= n;
        }
        Ok(sum)
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 8 * self.shape.len() + 8 * self.data.len());
        buf.put_u32_le(self.shape.len() as u32);
        for dim in &self.shape {
            buf.put_u64_le(*dim as u64);
        }
        for v in &self.data {
            buf.put_f64_le(*v);
        }
        buf.freeze()
    }

    pub(crate) fn decode(mut bytes: Bytes, device: DeviceId) -> Result<Self> {
        if bytes.remaining() < 4 {
            return Err(DistError::protocol("buffer frame shorter than its header"));
        }
        let ndim = bytes.get_u32_le() as usize;
        if bytes.remaining() < 8 * ndim {
            return Err(DistError::protocol("buffer frame truncated in shape"));
        }
        let shape: Vec<usize> = (0..ndim).map(|_| bytes.get_u64_le() as usize).collect();
        let len: usize = shape.iter().product();
        if bytes.remaining() != 8 * len {
            return Err(DistError::protocol(format!(
                "buffer frame carries {} bytes of data, shape {:?} needs {}",
                bytes.remaining(),
                shape,
                8 * len
            )));
        }
        let data = (0..len).map(|_| bytes.get_f64_le()).collect();
        Ok(Self {
            device,
            shape,
            data,
        })
    }
}

fn check_shapes(parts: &[Buffer], expected: &[usize]) -> Result<()> {
    for (rank, part) in parts.iter().enumerate() {
        if part.shape != expected {
            return Err(DistError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: part.shape.clone(),
                rank,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceId = DeviceId::new(0);

    #[test]
    fn test_with_shape_checks_element_count() {
        assert!(Buffer::with_shape(vec![1.0, 2.0, 3.0], vec![2, 2], DEV).is_err());
        let buf = Buffer::with_shape(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2], DEV).unwrap();
        assert_eq!(buf.shape(), &[2, 2]);
    }

    #[test]
    fn test_stack_keeps_part_order() {
        let parts = vec![
            Buffer::from_values(vec![1.0, 2.0], DEV),
            Buffer::from_values(vec![3.0, 4.0], DEV),
            Buffer::from_values(vec![5.0, 6.0], DEV),
        ];
        let stacked = Buffer::stack(&parts, DEV).unwrap();
        assert_eq!(stacked.shape(), &[3, 2]);
        let rows: Vec<&[f64]> = stacked.rows().collect();
        assert_eq!(rows, vec![&[1.0, 2.0][..], &[3.0, 4.0][..], &[5.0, 6.0][..]]);
    }

    #[test]
    fn test_sum_and_mean() {
        let parts = vec![
            Buffer::from_values(vec![1.0, 10.0], DEV),
            Buffer::from_values(vec![3.0, 20.0], DEV),
        ];
        assert_eq!(Buffer::sum_of(&parts, DEV).unwrap().as_slice(), &[4.0, 30.0]);
        assert_eq!(Buffer::mean_of(&parts, DEV).unwrap().as_slice(), &[2.0, 15.0]);
    }

    #[test]
    fn test_shape_mismatch_names_rank() {
        let parts = vec![
            Buffer::from_values(vec![1.0, 2.0], DEV),
            Buffer::from_values(vec![1.0], DEV),
        ];
        let err = Buffer::sum_of(&parts, DEV).unwrap_err();
        assert_eq!(
            err,
            DistError::ShapeMismatch {
                expected: vec![2],
                actual: vec![1],
                rank: 1
            }
        );
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let encoded = Buffer::from_values(vec![1.0, 2.0], DEV).encode();
        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(Buffer::decode(truncated, DEV).is_err());
    }

    #[test]
    fn test_decode_binds_receiving_device() {
        let encoded = Buffer::from_values(vec![0.5], DeviceId::new(3)).encode();
        let decoded = Buffer::decode(encoded, DeviceId::new(1)).unwrap();
        assert_eq!(decoded.device(), DeviceId::new(1));
        assert_eq!(decoded.as_slice(), &[0.5]);
    }
}
