// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lockstep Error System
//!
//! Every fallible operation in this crate returns a [`DistError`]. The variants
//! are categories a caller can branch on:
//!
//! - [`DistError::Initialization`]: the group could not be formed. Fatal, aborts startup.
//! - [`DistError::UnsupportedReduction`]: a reduction mode outside `{mean, sum, stacked}`
//!   was requested. Raised before any communication, even for a world size of one.
//! - everything else describes a broken transport or a malformed exchange.
//!
//! Deadlock by omission (a peer that never issues its matching collective) is
//! not an error: the collective simply never completes.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = DistError> = std::result::Result<T, E>;

// ============================================================================
// DistError
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DistError {
    /// The context is already initialized, the configuration is unusable,
    /// or the rendezvous endpoint could not be reached.
    #[error("failed to initialize distributed group: {reason}")]
    Initialization { reason: String },

    #[error("reduction={mode:?} is not supported, must be one of \"mean\" | \"sum\" | \"none\"")]
    UnsupportedReduction { mode: String },

    #[error("distributed context is not initialized")]
    NotInitialized,

    /// The underlying transport failed while a collective was in flight.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// A peer or the rendezvous server sent something that does not fit the protocol.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("rank {rank} contributed a buffer of shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
        rank: usize,
    },

    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },
}

impl DistError {
    pub fn initialization(reason: impl Into<String>) -> Self {
        Self::Initialization {
            reason: reason.into(),
        }
    }

    pub fn unsupported_reduction(mode: impl Into<String>) -> Self {
        Self::UnsupportedReduction { mode: mode.into() }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Returns true for errors that must abort startup.
    pub fn is_initialization(&self) -> bool {
        matches!(self, Self::Initialization { .. })
    }

    pub fn is_unsupported_reduction(&self) -> bool {
        matches!(self, Self::UnsupportedReduction { .. })
    }
}

impl From<std::io::Error> for DistError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // DistError crosses task boundaries, so it has to stay Send + Sync + 'static.
    const _: () = {
        fn assert_stderror<T: std::error::Error + Send + Sync + 'static>() {}
        fn assert_all() {
            assert_stderror::<DistError>();
        }
    };

    #[test]
    fn test_unsupported_reduction_message() {
        let err = DistError::unsupported_reduction("max");
        assert!(err.is_unsupported_reduction());
        assert!(!err.is_initialization());
        assert_eq!(
            err.to_string(),
            "reduction=\"max\" is not supported, must be one of \"mean\" | \"sum\" | \"none\""
        );
    }

    #[test]
    fn test_initialization_category() {
        let err = DistError::initialization("already initialized");
        assert!(err.is_initialization());
        assert_eq!(
            err.to_string(),
            "failed to initialize distributed group: already initialized"
        );
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DistError::from(io);
        assert_eq!(err, DistError::transport("reset by peer"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = DistError::ShapeMismatch {
            expected: vec![3],
            actual: vec![2],
            rank: 1,
        };
        assert_eq!(
            err.to_string(),
            "rank 1 contributed a buffer of shape [2], expected [3]"
        );
    }
}
