//! Error type of the RMA synchronization engine.

use thiserror::Error;

use crate::accumulate::ReduceOp;
use crate::datatype::BasicType;
use crate::Rank;

/// Errors surfaced by RMA calls and packet handlers.
///
/// Resource pressure in the lock queue never shows up here: it degrades to bare lock
/// buffering or to a discarded request that the origin retransmits on its own.
#[derive(Debug, Error)]
pub enum RmaError {
    /// The transport failed to move a packet.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The operator handle does not name a predefined reduction.
    #[error("operator handle {0:#x} is not a predefined reduction")]
    OpNotPredefined(u32),

    /// The reduction is not defined for the element type (e.g. bitwise ops on floats).
    #[error("operator {op} is not defined for {ty}")]
    OpTypeMismatch { op: ReduceOp, ty: BasicType },

    #[error("invalid datatype: {0}")]
    InvalidDatatype(&'static str),

    /// A region does not fit in the buffer it describes.
    #[error("access of {len} bytes at offset {offset} exceeds a buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("unknown window handle {0:#x}")]
    UnknownWindow(u32),

    #[error("rank {0} is not part of the window group")]
    InvalidRank(Rank),

    /// An RMA or synchronization call names a target without an open access epoch.
    #[error("no passive-target epoch is open for rank {0}")]
    NoEpoch(Rank),

    /// A lock call names a target (or window) that already has an epoch.
    #[error("an access epoch is already open for rank {0}")]
    EpochInProgress(Rank),

    /// A peer sent something the protocol does not allow at this point.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid value {value:?} for configuration key {key}")]
    Config { key: &'static str, value: String },
}

impl RmaError {
    /// Return true if the error must abort the communication session.
    ///
    /// Transport failures are surfaced to the caller, who decides; configuration and
    /// argument errors are the caller's to fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RmaError::OpNotPredefined(_) | RmaError::OpTypeMismatch { .. } | RmaError::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RmaError>;
