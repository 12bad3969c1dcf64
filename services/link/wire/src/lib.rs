//! Frame model for the LoRa/FSK link.
//!
//! This crate defines everything that goes on air: the fixed six byte
//! header, the flag byte, the application-facing [`LogicalPacket`], and the
//! link-control payloads (single and bulk acknowledgements, profile
//! negotiation, aggregates).
//!
//! ## Wire Format
//!
//! ```text
//! +--------------+-------------------------------+
//! | sender   u8  | source address                |
//! +--------------+-------------------------------+
//! | receiver u8  | destination, 0xFF = broadcast |
//! +--------------+-------------------------------+
//! | type     u8  | ASCII packet type tag         |
//! +--------------+-------------------------------+
//! | id       u8  | per-sender packet id          |
//! +--------------+-------------------------------+
//! | len      u8  | payload length (<= 85)        |
//! +--------------+-------------------------------+
//! | flags    u8  | see [`Flags`]                 |
//! +--------------+-------------------------------+
//! | payload      | 0..85 bytes                   |
//! +--------------+-------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod control;
pub mod error;
pub mod frame;
pub mod header;
pub mod packet;

pub use aggregate::{Aggregate, SubPacket, MAX_AGGREGATE_CANDIDATE, MAX_SUB_PACKETS};
pub use control::{
    decode_ack, decode_profile_index, encode_ack, encode_profile_index, BulkAck,
    MAX_BULK_ACK_IDS,
};
pub use error::WireError;
pub use frame::{Frame, MAX_FRAME_SIZE, MAX_PAYLOAD};
pub use header::{Address, Flags, Header, PacketId, PacketType, HEADER_SIZE};
pub use packet::{frame_packet, LogicalPacket, PacketFlags};
