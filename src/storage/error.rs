//! Storage error types.
//!
//! The store surfaces structured errors; the HTTP layer decides how each one
//! maps to a status code.

use thiserror::Error;

use super::types::PartitionId;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced while decoding a [`VoteRecord`](super::types::VoteRecord).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the frame or a field declared.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// A required field id never appeared in the body.
    #[error("missing required field {0}")]
    MissingField(u16),

    /// The same field id appeared twice.
    #[error("duplicate field {0}")]
    DuplicateField(u16),

    /// A known field id carried an unexpected wire type.
    #[error("field {field} has wire type {actual}, expected {expected}")]
    WrongWireType { field: u16, expected: u8, actual: u8 },

    /// The wire type byte is not one this codec understands.
    #[error("unknown wire type {wire_type} for field {field}")]
    UnknownWireType { field: u16, wire_type: u8 },

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(u16),

    #[error("timestamp out of range: {seconds}s {nanos}ns")]
    InvalidTimestamp { seconds: i64, nanos: u32 },

    /// Decoded values break `max_count >= count`.
    #[error("max count {max_count} is below count {count}")]
    InvalidCounts { count: u64, max_count: u64 },
}

/// Errors produced by the counter store and its replication substrate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer committed the key after this transaction read it.
    #[error("conflicting update on key {key:?}")]
    Conflict { key: String },

    #[error("key {key:?} not found")]
    NotFound { key: String },

    /// The local replica may not write to this partition.
    #[error("replica is not primary for partition {partition}")]
    NotPrimary { partition: PartitionId },

    /// A primary was asked to apply another replica's mutation.
    #[error("replica is primary for partition {partition}; refusing replicated write")]
    AlreadyPrimary { partition: PartitionId },

    #[error("operation cancelled")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A commit log entry failed validation somewhere other than the tail.
    #[error("corrupt commit log for partition {partition} at offset {offset}: {reason}")]
    Corrupt {
        partition: PartitionId,
        offset: u64,
        reason: &'static str,
    },

    #[error("replication failed: {0}")]
    Replication(String),
}
