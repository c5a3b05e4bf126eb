//! Header flag bytes.
//!
//! ```text
//! byte 1  protocol flags     BINCODE | CIPHER | JSON | FLUSH
//! byte 2  compression level  [algo bits 4..7][level 0..15]
//! ```

use bitflags::bitflags;

bitflags! {
    /// Protocol flags carried in the second header byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolFlags: u8 {
        /// Body is bincode-serialised.
        const BINCODE = 0x01;
        /// Body is encrypted (not supported by this implementation).
        const CIPHER  = 0x02;
        /// Body is JSON.
        const JSON    = 0x04;
        /// Sender has more packets queued; receiver may delay processing.
        const FLUSH   = 0x08;
    }
}

impl ProtocolFlags {
    /// Serializer bits; at most one may be set.
    pub const SERIALIZERS: ProtocolFlags = ProtocolFlags::BINCODE.union(ProtocolFlags::JSON);

    /// Whether more than one serializer bit is set.
    pub fn has_conflicting_serializers(self) -> bool {
        self.intersection(Self::SERIALIZERS).bits().count_ones() > 1
    }
}

// ── Compression level byte ───────────────────────────────────────

/// Low nibble of the level byte: the compression level.
pub const LEVEL_MASK: u8 = 0x0F;
/// lz4 block compression.
pub const LZ4_FLAG: u8 = 0x10;
/// Reserved slot (historically lzo); always rejected.
pub const RESERVED_FLAG: u8 = 0x20;
/// zstd compression.
pub const ZSTD_FLAG: u8 = 0x40;
/// All algorithm bits.
pub const ALGO_MASK: u8 = LZ4_FLAG | RESERVED_FLAG | ZSTD_FLAG;

/// Number of algorithm bits set in a level byte.
pub fn compressor_bits(level: u8) -> u32 {
    (level & ALGO_MASK).count_ones()
}
