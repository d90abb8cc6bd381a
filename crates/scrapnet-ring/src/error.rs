//! Ring error types and result definitions.

use std::time::Duration;

use thiserror::Error;

/// Result type for ring operations.
pub type RingResult<T> = Result<T, RingError>;

/// Ring-specific errors.
///
/// A [`RingError::PeerUnreachable`] is never surfaced to external callers;
/// the ring treats the peer as dead for that decision and repairs itself.
#[derive(Error, Debug)]
pub enum RingError {
    /// RPC or probe to a peer failed or timed out
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    /// Operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed or oversized wire frame
    #[error("wire protocol error: {0}")]
    Wire(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for RingError {
    fn from(err: bincode::Error) -> Self {
        Self::Wire(err.to_string())
    }
}
