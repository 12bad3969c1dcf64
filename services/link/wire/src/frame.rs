//! On-air frame: fixed header followed by up to 85 payload bytes.

use crate::header::{Flags, Header, PacketType, HEADER_SIZE};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Maximum payload carried by one frame
pub const MAX_PAYLOAD: usize = 85;

/// Upper bound on any buffer accepted as a frame
pub const MAX_FRAME_SIZE: usize = 150;

/// A complete wire frame.
///
/// `header.payload_len` always equals `payload.len()` for frames built through
/// [`Frame::new`] or [`Frame::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: Header,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame, checking the payload limit and fixing up the length byte
    pub fn new(mut header: Header, payload: Bytes) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::Size(payload.len()));
        }
        header.payload_len = payload.len() as u8;
        Ok(Self { header, payload })
    }

    /// Packet type
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    /// Packet id
    pub fn id(&self) -> u8 {
        self.header.packet_id
    }

    /// Flag bits
    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    /// Whether the receiver must acknowledge this frame
    pub fn ack_required(&self) -> bool {
        self.header.flags.contains(Flags::ACK_REQUIRED)
    }

    /// Whether this frame jumps the queue
    pub fn is_high_priority(&self) -> bool {
        self.header.flags.contains(Flags::HIGH_PRIORITY)
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let mut header = self.header;
        header.payload_len = self.payload.len() as u8;
        header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a received buffer.
    ///
    /// Bytes after the declared payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(WireError::Size(buf.len()));
        }

        let mut cursor = buf;
        let header = Header::decode(&mut cursor)?;

        let len = header.payload_len as usize;
        if len > MAX_PAYLOAD {
            return Err(WireError::Size(len));
        }
        if cursor.len() < len {
            return Err(WireError::Malformed);
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&cursor[..len]),
        })
    }
}
