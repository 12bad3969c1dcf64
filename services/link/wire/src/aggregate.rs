//! Aggregate payloads: several small sub-packets to one destination packed
//! into a single frame.
//!
//! ```text
//! +---------+--------+-------------------+ ... up to 5 groups
//! | subType | subLen | subPayload[subLen] |
//! +---------+--------+-------------------+
//! ```

use crate::frame::MAX_PAYLOAD;
use crate::header::PacketType;
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Maximum sub-packets per aggregate
pub const MAX_SUB_PACKETS: usize = 5;

/// Per sub-packet overhead (type + length)
pub const SUB_HEADER_SIZE: usize = 2;

/// Largest payload considered for aggregation
pub const MAX_AGGREGATE_CANDIDATE: usize = 30;

/// One packet folded into an aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubPacket {
    /// Original packet type
    pub packet_type: PacketType,
    /// Original payload
    pub payload: Bytes,
}

/// Aggregate payload builder and parser
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregate {
    entries: SmallVec<[SubPacket; MAX_SUB_PACKETS]>,
}

impl Aggregate {
    /// Empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded payload size
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|e| SUB_HEADER_SIZE + e.payload.len())
            .sum()
    }

    /// Whether a sub-packet with `len` payload bytes would fit
    pub fn can_fit(&self, len: usize) -> bool {
        self.entries.len() < MAX_SUB_PACKETS
            && self.encoded_len() + SUB_HEADER_SIZE + len <= MAX_PAYLOAD
    }

    /// Append a sub-packet
    pub fn push(&mut self, packet_type: PacketType, payload: Bytes) -> Result<(), WireError> {
        if !self.can_fit(payload.len()) {
            return Err(WireError::Capacity);
        }
        self.entries.push(SubPacket {
            packet_type,
            payload,
        });
        Ok(())
    }

    /// Sub-packets in order
    pub fn entries(&self) -> &[SubPacket] {
        &self.entries
    }

    /// Number of sub-packets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No sub-packets
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode the payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        for entry in &self.entries {
            buf.put_u8(entry.packet_type.into());
            buf.put_u8(entry.payload.len() as u8);
            buf.put_slice(&entry.payload);
        }
        buf.freeze()
    }

    /// Parse an aggregate payload
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::Size(payload.len()));
        }

        let mut agg = Self::new();
        let mut rest = payload;
        while !rest.is_empty() {
            if rest.len() < SUB_HEADER_SIZE {
                return Err(WireError::Malformed);
            }
            let packet_type = PacketType::from(rest[0]);
            let len = rest[1] as usize;
            rest = &rest[SUB_HEADER_SIZE..];
            if rest.len() < len {
                return Err(WireError::Malformed);
            }
            if agg.entries.len() >= MAX_SUB_PACKETS {
                return Err(WireError::Capacity);
            }
            agg.entries.push(SubPacket {
                packet_type,
                payload: Bytes::copy_from_slice(&rest[..len]),
            });
            rest = &rest[len..];
        }
        Ok(agg)
    }
}
