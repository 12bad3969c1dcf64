//! Engine and transport error types.

use link_wire::WireError;
use thiserror::Error;

/// Radio transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Radio rejected a configuration command
    #[error("radio rejected {setting}: code {code}")]
    Command {
        /// Setting being applied
        setting: &'static str,
        /// Driver status code
        code: i16,
    },

    /// Setting not supported by this radio
    #[error("unsupported setting: {0}")]
    Unsupported(&'static str),

    /// Received packet failed the integrity check
    #[error("integrity check failed")]
    Integrity,

    /// Woken up but no packet was waiting
    #[error("no packet available")]
    NoPacket,

    /// I/O error from a socket backed transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link engine errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Frame could not be built
    #[error("framing error: {0}")]
    Framing(#[from] WireError),

    /// Queue did not accept the frame within its wait bound
    #[error("queue full")]
    QueueFull,

    /// Internal lock not acquired within its bound
    #[error("lock timeout: {0}")]
    LockTimeout(&'static str),

    /// Radio failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Profile index outside the table
    #[error("invalid profile index {0}")]
    InvalidProfile(u8),

    /// Engine has been shut down
    #[error("engine stopped")]
    Stopped,
}
