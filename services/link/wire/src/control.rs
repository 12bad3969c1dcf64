//! Link-control payloads: single ACK, bulk ACK and profile index.

use crate::header::PacketId;
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Maximum ids carried by one bulk ACK
pub const MAX_BULK_ACK_IDS: usize = 10;

fn expect_len(payload: &[u8], expected: usize) -> Result<(), WireError> {
    if payload.len() != expected {
        return Err(WireError::ControlLength {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Encode a single ACK payload
pub fn encode_ack(id: PacketId) -> Bytes {
    Bytes::copy_from_slice(&[id])
}

/// Decode a single ACK payload
pub fn decode_ack(payload: &[u8]) -> Result<PacketId, WireError> {
    expect_len(payload, 1)?;
    Ok(payload[0])
}

/// Encode a negotiation request or response payload
pub fn encode_profile_index(index: u8) -> Bytes {
    Bytes::copy_from_slice(&[index])
}

/// Decode a negotiation request or response payload
pub fn decode_profile_index(payload: &[u8]) -> Result<u8, WireError> {
    expect_len(payload, 1)?;
    Ok(payload[0])
}

/// Batched acknowledgement: `[count][id x count]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkAck {
    ids: SmallVec<[PacketId; MAX_BULK_ACK_IDS]>,
}

impl BulkAck {
    /// Empty bulk ACK
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an id. Returns false if it is already present or the batch is full.
    pub fn add(&mut self, id: PacketId) -> bool {
        if self.is_full() || self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Number of ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// No ids
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Batch holds [`MAX_BULK_ACK_IDS`] ids
    pub fn is_full(&self) -> bool {
        self.ids.len() >= MAX_BULK_ACK_IDS
    }

    /// Ids as carried
    pub fn ids(&self) -> &[PacketId] {
        &self.ids
    }

    /// Whether any id appears more than once (only possible on decoded input)
    pub fn has_duplicates(&self) -> bool {
        self.ids
            .iter()
            .enumerate()
            .any(|(i, id)| self.ids[..i].contains(id))
    }

    /// Ids with duplicates removed, first occurrence order
    pub fn unique_ids(&self) -> SmallVec<[PacketId; MAX_BULK_ACK_IDS]> {
        let mut unique = SmallVec::new();
        for id in &self.ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        unique
    }

    /// Drop all ids
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Encode the payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.ids.len());
        buf.put_u8(self.ids.len() as u8);
        buf.put_slice(&self.ids);
        buf.freeze()
    }

    /// Decode a payload. The count must be at most [`MAX_BULK_ACK_IDS`] and
    /// the payload must be exactly `1 + count` bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let (&count, ids) = payload.split_first().ok_or(WireError::BulkAckLength)?;
        if count as usize > MAX_BULK_ACK_IDS {
            return Err(WireError::BulkAckCount(count));
        }
        if ids.len() != count as usize {
            return Err(WireError::BulkAckLength);
        }
        Ok(Self {
            ids: SmallVec::from_slice(ids),
        })
    }
}
