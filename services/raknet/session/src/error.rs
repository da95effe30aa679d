//! Session layer error types.

use crate::session::SessionState;
use raknet_wire::WireError;
use std::net::SocketAddr;
use thiserror::Error;

/// Fragment reassembly errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Split count of zero
    #[error("invalid split count {0}")]
    InvalidCount(u32),

    /// Split index not below split count
    #[error("split index {index} out of range for count {count}")]
    IndexOutOfRange {
        /// Offending index
        index: u32,
        /// Declared count
        count: u32,
    },

    /// A later fragment declared a different count than the first one
    #[error("split count mismatch: expected {expected}, got {got}")]
    CountMismatch {
        /// Count recorded for the split id
        expected: u32,
        /// Count carried by the new fragment
        got: u32,
    },

    /// Split count above the per-message cap
    #[error("split count {0} exceeds the configured maximum")]
    TooManyParts(u32),
}

/// Session layer errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Malformed packet
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Session is closing or gone and accepts no new messages
    #[error("session is closed")]
    Closed,

    /// No session for the address
    #[error("no session for {0}")]
    NotFound(SocketAddr),

    /// Operation not valid in the current state
    #[error("operation not valid in state {0:?}")]
    InvalidState(SessionState),

    /// Invalid fragment
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
