//! Fixed 8-byte packet header.
//!
//! ```text
//! ┌────────┬────────┬────────┬────────┬──────────────────────────┐
//! │ marker │ flags  │ level  │ index  │ payload size (u32, BE)   │
//! │  'P'   │  u8    │  u8    │  u8    │                          │
//! └────────┴────────┴────────┴────────┴──────────────────────────┘
//! ```
//!
//! `index` 0 is the main (serialised) packet; indices above zero are raw
//! chunks that the main packet refers to.

use crate::error::PixwireError;
use crate::flags::{LEVEL_MASK, ProtocolFlags, compressor_bits};

/// Size of the packet header in bytes.
pub const HEADER_SIZE: usize = 8;
/// First byte of every header.
pub const MARKER: u8 = b'P';
/// Largest payload any header may declare.
pub const MAX_PACKET_SIZE: u32 = 256 * 1024 * 1024;

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Marker byte (always [`MARKER`] for valid packets).
    pub marker: u8,
    /// Serializer / transport flags.
    pub flags: ProtocolFlags,
    /// Compression level byte (algorithm bits + level).
    pub level: u8,
    /// Chunk index: 0 for the main packet.
    pub index: u8,
    /// Payload size in bytes (header excluded).
    pub size: u32,
}

impl PacketHeader {
    /// Header for a main packet.
    pub fn new(flags: ProtocolFlags, level: u8, index: u8, size: u32) -> Self {
        Self {
            marker: MARKER,
            flags,
            level,
            index,
            size,
        }
    }

    /// Serialise to wire bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        pack_header(self.flags, self.level, self.index, self.size)
    }

    /// Whether this header could start a real packet.
    pub fn is_plausible(&self, expected_index: u8, max_size: u32) -> bool {
        if self.marker != MARKER || self.index != expected_index {
            return false;
        }
        if self.size >= max_size {
            return false;
        }
        if self.flags.has_conflicting_serializers() {
            return false;
        }
        match compressor_bits(self.level) {
            0 => true,
            1 => self.level & LEVEL_MASK > 0,
            _ => false,
        }
    }
}

/// Pack header fields into 8 big-endian bytes.
pub fn pack_header(flags: ProtocolFlags, level: u8, packet_index: u8, payload_size: u32) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0] = MARKER;
    out[1] = flags.bits();
    out[2] = level;
    out[3] = packet_index;
    out[4..8].copy_from_slice(&payload_size.to_be_bytes());
    out
}

/// Parse the first 8 bytes of `bytes`.
///
/// Fails with [`PixwireError::MalformedHeader`] on short input. The marker
/// is returned as read; use [`PacketHeader::is_plausible`] to validate.
pub fn unpack_header(bytes: &[u8]) -> Result<PacketHeader, PixwireError> {
    if bytes.len() < HEADER_SIZE {
        return Err(PixwireError::MalformedHeader("fewer than 8 header bytes"));
    }
    Ok(PacketHeader {
        marker: bytes[0],
        flags: ProtocolFlags::from_bits_retain(bytes[1]),
        level: bytes[2],
        index: bytes[3],
        size: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
    })
}

/// Scan `buffer` for the first offset holding a plausible header.
///
/// Used to resynchronise a stream after a partial or corrupted read.
/// Returns `None` when no candidate validates.
pub fn find_header(buffer: &[u8], expected_index: u8, max_size: u32) -> Option<usize> {
    if buffer.len() < HEADER_SIZE {
        return None;
    }
    (0..=buffer.len() - HEADER_SIZE).find(|&pos| {
        buffer[pos] == MARKER
            && unpack_header(&buffer[pos..])
                .map(|h| h.is_plausible(expected_index, max_size))
                .unwrap_or(false)
    })
}

// ── Tests ────────────────────────────────────────────────────────
