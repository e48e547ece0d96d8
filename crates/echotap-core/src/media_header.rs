//! Codec for the 12-byte fixed header carried by every media datagram.
//!
//! Wire layout (all multi-byte fields big-endian):
//!
//! ```text
//! ┌─────────────┬─────────────┬──────────────┬──────────────┬──────────┐
//! │ V P X CC    │ M PT        │  sequence    │  timestamp   │   ssrc   │
//! │ (1 byte)    │ (1 byte)    │  (2 bytes)   │  (4 bytes)   │ (4 bytes)│
//! └─────────────┴─────────────┴──────────────┴──────────────┴──────────┘
//! ```
//!
//! The probe only consumes `sequence_number` and `timestamp`; the rest is
//! parsed for validation and diagnostics and every datagram is forwarded
//! byte-for-byte, never re-marshalled.

/// Size of the fixed media header in bytes.
pub const MEDIA_HEADER_LEN: usize = 12;

const MEDIA_PROTOCOL_VERSION: u8 = 2;

/// Parsed view of the fixed media header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaHeader {
    pub version: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl MediaHeader {
    /// Parses the header from the front of a datagram. Returns `None` for
    /// truncated datagrams or an unknown protocol version.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < MEDIA_HEADER_LEN {
            return None;
        }
        let version = datagram[0] >> 6;
        if version != MEDIA_PROTOCOL_VERSION {
            return None;
        }
        Some(Self {
            version,
            marker: datagram[1] & 0x80 != 0,
            payload_type: datagram[1] & 0x7f,
            sequence_number: u16::from_be_bytes([datagram[2], datagram[3]]),
            timestamp: u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]),
            ssrc: u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]),
        })
    }

    /// Serializes the header. Used by test harnesses that synthesise media
    /// streams; the relay path never rewrites captured datagrams.
    pub fn to_bytes(&self) -> [u8; MEDIA_HEADER_LEN] {
        let mut bytes = [0u8; MEDIA_HEADER_LEN];
        bytes[0] = MEDIA_PROTOCOL_VERSION << 6;
        bytes[1] = (self.payload_type & 0x7f) | if self.marker { 0x80 } else { 0 };
        bytes[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        bytes
    }
}

/// Builds a complete datagram for the given header and payload.
pub fn encode_packet(header: &MediaHeader, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MEDIA_HEADER_LEN + payload.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload);
    packet
}
