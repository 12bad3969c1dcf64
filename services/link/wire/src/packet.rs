//! Application-facing packet descriptor and the framing step.
//!
//! A [`LogicalPacket`] carries delivery intent as plain booleans. Framing
//! packs those into the wire [`Flags`] byte and resolves `broadcast` to the
//! broadcast address.

use crate::frame::{Frame, MAX_PAYLOAD};
use crate::header::{Address, Flags, Header, PacketId, PacketType};
use crate::WireError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Logical delivery flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFlags {
    /// Receiver must acknowledge
    pub ack_required: bool,
    /// Jump the queue
    pub high_priority: bool,
    /// Link service traffic
    pub service: bool,
    /// Do not retransmit
    pub no_retry: bool,
    /// Payload encrypted by a higher layer
    pub encrypted: bool,
    /// Payload compressed by a higher layer
    pub compressed: bool,
    /// Payload is an aggregate
    pub aggregated: bool,
    /// Keep on the receiving node
    pub internal_only: bool,
    /// Address every node
    pub broadcast: bool,
}

impl PacketFlags {
    /// Pack into the wire flag byte. `broadcast` has no bit; it lives in the
    /// receiver address.
    pub fn to_wire(self) -> Flags {
        let mut flags = Flags::empty();
        flags.set(Flags::ACK_REQUIRED, self.ack_required);
        flags.set(Flags::HIGH_PRIORITY, self.high_priority);
        flags.set(Flags::SERVICE, self.service);
        flags.set(Flags::NO_RETRY, self.no_retry);
        flags.set(Flags::ENCRYPTED, self.encrypted);
        flags.set(Flags::COMPRESSED, self.compressed);
        flags.set(Flags::AGGREGATED, self.aggregated);
        flags.set(Flags::INTERNAL_ONLY, self.internal_only);
        flags
    }

    /// Unpack from the wire flag byte and receiver address
    pub fn from_wire(flags: Flags, receiver: Address) -> Self {
        Self {
            ack_required: flags.contains(Flags::ACK_REQUIRED),
            high_priority: flags.contains(Flags::HIGH_PRIORITY),
            service: flags.contains(Flags::SERVICE),
            no_retry: flags.contains(Flags::NO_RETRY),
            encrypted: flags.contains(Flags::ENCRYPTED),
            compressed: flags.contains(Flags::COMPRESSED),
            aggregated: flags.contains(Flags::AGGREGATED),
            internal_only: flags.contains(Flags::INTERNAL_ONLY),
            broadcast: receiver.is_broadcast(),
        }
    }
}

/// Pre-framing description of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPacket {
    /// Packet type
    pub packet_type: PacketType,
    /// Packet id, assigned by the engine at send time
    pub packet_id: PacketId,
    /// Number of payload bytes to take from the supplied payload
    pub payload_len: u8,
    /// Delivery flags
    pub flags: PacketFlags,
}

impl LogicalPacket {
    /// Packet with no payload and no flags
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            packet_id: 0,
            payload_len: 0,
            flags: PacketFlags::default(),
        }
    }

    /// Set the payload length
    pub fn with_len(mut self, len: u8) -> Self {
        self.payload_len = len;
        self
    }

    /// Request an acknowledgement
    pub fn ack_required(mut self) -> Self {
        self.flags.ack_required = true;
        self
    }

    /// Mark high priority
    pub fn high_priority(mut self) -> Self {
        self.flags.high_priority = true;
        self
    }

    /// Mark as link service traffic
    pub fn service(mut self) -> Self {
        self.flags.service = true;
        self
    }

    /// Send to every node
    pub fn broadcast(mut self) -> Self {
        self.flags.broadcast = true;
        self
    }

    /// Replace all flags
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Build a wire frame from a logical packet.
///
/// Fails when the declared length is over [`MAX_PAYLOAD`] or when a non-zero
/// length is declared without enough payload bytes behind it.
pub fn frame_packet(
    sender: Address,
    receiver: Address,
    packet: &LogicalPacket,
    payload: Option<&[u8]>,
) -> Result<Frame, WireError> {
    let len = packet.payload_len as usize;
    if len > MAX_PAYLOAD {
        warn!(
            packet_type = %packet.packet_type,
            len,
            "Payload too large, frame not built"
        );
        return Err(WireError::Size(len));
    }

    let body = match payload {
        _ if len == 0 => Bytes::new(),
        Some(bytes) if bytes.len() >= len => Bytes::copy_from_slice(&bytes[..len]),
        _ => {
            warn!(
                packet_type = %packet.packet_type,
                len,
                "Payload missing, frame not built"
            );
            return Err(WireError::MissingPayload(packet.payload_len));
        }
    };

    let receiver = if packet.flags.broadcast {
        Address::BROADCAST
    } else {
        receiver
    };

    let mut header = Header::new(packet.packet_type, sender, receiver, packet.packet_id);
    header.flags = packet.flags.to_wire();
    Frame::new(header, body)
}

impl Frame {
    /// Recover the logical descriptor
    pub fn to_logical(&self) -> LogicalPacket {
        LogicalPacket {
            packet_type: self.header.packet_type,
            packet_id: self.header.packet_id,
            payload_len: self.payload.len() as u8,
            flags: PacketFlags::from_wire(self.header.flags, self.header.receiver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_and_unframe() {
        let mut packet = LogicalPacket::new(PacketType::Nav)
            .with_len(4)
            .ack_required()
            .high_priority();
        packet.packet_id = 200;
        packet.flags.compressed = true;

        let frame = frame_packet(Address(1), Address(2), &packet, Some(b"abcd")).unwrap();
        assert_eq!(frame.flags().bits(), 0x01 | 0x02 | 0x20);

        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.to_logical(), packet);
        assert_eq!(&decoded.payload[..], b"abcd");
    }

    #[test]
    fn test_flags_to_wire_bits() {
        let flags = PacketFlags {
            service: true,
            no_retry: true,
            encrypted: true,
            aggregated: true,
            internal_only: true,
            ..Default::default()
        };
        assert_eq!(flags.to_wire().bits(), 0x04 | 0x08 | 0x10 | 0x40 | 0x80);
    }

    #[test]
    fn test_broadcast_receiver() {
        let packet = LogicalPacket::new(PacketType::Heartbeat).broadcast();
        let frame = frame_packet(Address(1), Address(2), &packet, None).unwrap();
        assert_eq!(frame.header.receiver, Address::BROADCAST);
        assert!(frame.to_logical().flags.broadcast);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let packet = LogicalPacket::new(PacketType::Status).with_len(86);
        let payload = [0u8; 86];
        assert_eq!(
            frame_packet(Address(1), Address(2), &packet, Some(&payload)),
            Err(WireError::Size(86))
        );
    }

    #[test]
    fn test_missing_payload_rejected() {
        let packet = LogicalPacket::new(PacketType::Status).with_len(3);
        assert_eq!(
            frame_packet(Address(1), Address(2), &packet, None),
            Err(WireError::MissingPayload(3))
        );
        assert_eq!(
            frame_packet(Address(1), Address(2), &packet, Some(b"ab")),
            Err(WireError::MissingPayload(3))
        );
    }

    #[test]
    fn test_declared_length_truncates_payload() {
        let packet = LogicalPacket::new(PacketType::CommandString).with_len(2);
        let frame = frame_packet(Address(1), Address(2), &packet, Some(b"abcdef")).unwrap();
        assert_eq!(&frame.payload[..], b"ab");
    }
}
