//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the fixed header
    #[error("incomplete frame: {0} bytes is shorter than the header")]
    Incomplete(usize),

    /// Size limit exceeded (payload over 85 bytes or frame over 150 bytes)
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Payload length declared but no payload bytes supplied
    #[error("payload missing for declared length {0}")]
    MissingPayload(u8),

    /// Declared payload length runs past the end of the buffer
    #[error("malformed frame")]
    Malformed,

    /// Aggregate cannot take another sub-packet
    #[error("aggregate capacity exceeded")]
    Capacity,

    /// Bulk ACK count over the limit
    #[error("bulk ack count {0} exceeds limit")]
    BulkAckCount(u8),

    /// Bulk ACK payload length does not match its count byte
    #[error("bulk ack length mismatch")]
    BulkAckLength,

    /// Control payload (ACK, profile index) has the wrong length
    #[error("control payload length {actual}, expected {expected}")]
    ControlLength {
        /// Required payload length
        expected: usize,
        /// Length received
        actual: usize,
    },
}
