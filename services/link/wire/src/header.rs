//! Fixed six byte frame header.
//!
//! Every field is a single byte, so the layout is identical on any endianness:
//!
//! ```text
//! +--------+----------+------+----+-------------+-------+
//! | sender | receiver | type | id | payload_len | flags |
//! +--------+----------+------+----+-------------+-------+
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header size in bytes
pub const HEADER_SIZE: usize = 6;

/// Per-node packet identifier. Wraps at 256.
pub type PacketId = u8;

/// One byte link address
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub u8);

impl Address {
    /// Broadcast address, heard by every node
    pub const BROADCAST: Address = Address(0xFF);
    /// Conventional address of the master (mission control) node
    pub const MASTER: Address = Address(0x01);
    /// Conventional address of the slave (remote) node
    pub const SLAVE: Address = Address(0x02);

    /// Whether this is the broadcast address
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet types carried in the `type` byte.
///
/// Tags are ASCII characters. Bytes outside the known set are preserved as
/// [`PacketType::Other`] so applications can define their own types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Single acknowledgement `'A'`
    Ack,
    /// Batched acknowledgement `'B'`
    BulkAck,
    /// Free-form command string `'C'`
    CommandString,
    /// Configuration `'F'`
    Config,
    /// Engine information `'I'`
    InfoEngine,
    /// Navigation `'N'`
    Nav,
    /// Ping `'P'`
    Ping,
    /// Heartbeat `'H'`
    Heartbeat,
    /// Pong `'Q'`
    Pong,
    /// RSSI report `'R'`
    RssiReport,
    /// Status `'S'`
    Status,
    /// Telemetry fragment `'T'`
    TelemetryFragment,
    /// Information request `'i'`
    RequestInfo,
    /// Command response `'r'`
    CommandResponse,
    /// Profile negotiation request `'a'`
    ProfileRequest,
    /// Profile negotiation response `'b'`
    ProfileResponse,
    /// Aggregate of several sub-packets `'G'`
    Aggregate,
    /// Application-defined type
    Other(u8),
}

impl PacketType {
    /// Link-control frames are never folded into aggregates and are routed
    /// away from the application by the receive path.
    pub fn is_link_control(self) -> bool {
        matches!(
            self,
            PacketType::Ack
                | PacketType::BulkAck
                | PacketType::ProfileRequest
                | PacketType::ProfileResponse
        )
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            b'A' => PacketType::Ack,
            b'B' => PacketType::BulkAck,
            b'C' => PacketType::CommandString,
            b'F' => PacketType::Config,
            b'I' => PacketType::InfoEngine,
            b'N' => PacketType::Nav,
            b'P' => PacketType::Ping,
            b'H' => PacketType::Heartbeat,
            b'Q' => PacketType::Pong,
            b'R' => PacketType::RssiReport,
            b'S' => PacketType::Status,
            b'T' => PacketType::TelemetryFragment,
            b'i' => PacketType::RequestInfo,
            b'r' => PacketType::CommandResponse,
            b'a' => PacketType::ProfileRequest,
            b'b' => PacketType::ProfileResponse,
            b'G' => PacketType::Aggregate,
            other => PacketType::Other(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::Ack => b'A',
            PacketType::BulkAck => b'B',
            PacketType::CommandString => b'C',
            PacketType::Config => b'F',
            PacketType::InfoEngine => b'I',
            PacketType::Nav => b'N',
            PacketType::Ping => b'P',
            PacketType::Heartbeat => b'H',
            PacketType::Pong => b'Q',
            PacketType::RssiReport => b'R',
            PacketType::Status => b'S',
            PacketType::TelemetryFragment => b'T',
            PacketType::RequestInfo => b'i',
            PacketType::CommandResponse => b'r',
            PacketType::ProfileRequest => b'a',
            PacketType::ProfileResponse => b'b',
            PacketType::Aggregate => b'G',
            PacketType::Other(other) => other,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = u8::from(*self);
        if tag.is_ascii_graphic() {
            write!(f, "{}", tag as char)
        } else {
            write!(f, "0x{:02X}", tag)
        }
    }
}

bitflags! {
    /// Frame flags byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Receiver must acknowledge this frame
        const ACK_REQUIRED = 0x01;
        /// Jumps the queue on both ends
        const HIGH_PRIORITY = 0x02;
        /// Link service traffic
        const SERVICE = 0x04;
        /// Sender will not retransmit
        const NO_RETRY = 0x08;
        /// Payload is encrypted by a higher layer
        const ENCRYPTED = 0x10;
        /// Payload is compressed by a higher layer
        const COMPRESSED = 0x20;
        /// Payload is an aggregate of sub-packets
        const AGGREGATED = 0x40;
        /// Not to be forwarded beyond the receiving node
        const INTERNAL_ONLY = 0x80;
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sending node
    pub sender: Address,
    /// Receiving node (or broadcast)
    pub receiver: Address,
    /// Packet type tag
    pub packet_type: PacketType,
    /// Packet id assigned by the sender
    pub packet_id: PacketId,
    /// Number of payload bytes following the header
    pub payload_len: u8,
    /// Flag bits
    pub flags: Flags,
}

impl Header {
    /// Create a header with no payload and no flags
    pub fn new(
        packet_type: PacketType,
        sender: Address,
        receiver: Address,
        packet_id: PacketId,
    ) -> Self {
        Self {
            sender,
            receiver,
            packet_type,
            packet_id,
            payload_len: 0,
            flags: Flags::empty(),
        }
    }

    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.sender.0);
        buf.put_u8(self.receiver.0);
        buf.put_u8(self.packet_type.into());
        buf.put_u8(self.packet_id);
        buf.put_u8(self.payload_len);
        buf.put_u8(self.flags.bits());
    }

    /// Decode the header, consuming [`HEADER_SIZE`] bytes
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, crate::WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(crate::WireError::Incomplete(buf.remaining()));
        }

        let sender = Address(buf.get_u8());
        let receiver = Address(buf.get_u8());
        let packet_type = PacketType::from(buf.get_u8());
        let packet_id = buf.get_u8();
        let payload_len = buf.get_u8();
        let flags = Flags::from_bits_retain(buf.get_u8());

        Ok(Self {
            sender,
            receiver,
            packet_type,
            packet_id,
            payload_len,
            flags,
        })
    }
}
