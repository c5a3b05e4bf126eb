//! Packets exchanged with the client.
//!
//! Only the server-to-client drawing path is modelled: `Draw` carries one
//! encoded region, `Disconnect` tells the client why the stream ends.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compression::CompressedPayload;

/// Option keys attached to draw packets.
pub mod keys {
    pub const FRAME: &str = "frame";
    pub const PTS: &str = "pts";
    pub const QUALITY: &str = "quality";
    pub const SPEED: &str = "speed";
    pub const CSC: &str = "csc";
    pub const ENCODER: &str = "encoder";
    pub const SCALED_SIZE: &str = "scaled_size";
    pub const DELAYED: &str = "delayed";
    pub const FLUSH: &str = "flush";
    pub const FLUSH_ENCODER: &str = "flush-encoder";
    pub const DAMAGE_SEQUENCE: &str = "damage-sequence";
    pub const COMPRESS_LEVEL: &str = "compress-level";
}

/// A typed value in a draw packet's option map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Size(u32, u32),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<u64> for OptionValue {
    fn from(v: u64) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<u8> for OptionValue {
    fn from(v: u8) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

impl From<(u32, u32)> for OptionValue {
    fn from((w, h): (u32, u32)) -> Self {
        OptionValue::Size(w, h)
    }
}

/// One scrolled block: copy `w x h` at `(x, y)` by `(dx, dy)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub dx: i32,
    pub dy: i32,
}

impl ScrollRect {
    pub fn new(x: u32, y: u32, w: u32, h: u32, dx: i32, dy: i32) -> Self {
        Self { x, y, w, h, dx, dy }
    }
}

/// Payload of a draw packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrawData {
    /// Bytes sent as-is.
    Raw(Vec<u8>),
    /// Picture or video data with its compression descriptor.
    Compressed(CompressedPayload),
    /// Scroll instructions.
    Scroll(Vec<ScrollRect>),
    /// Placeholder for a raw chunk sent ahead with this packet index.
    Chunk(u8),
}

impl DrawData {
    /// Payload bytes on the wire (0 for scroll and chunk placeholders).
    pub fn len(&self) -> usize {
        match self {
            DrawData::Raw(d) => d.len(),
            DrawData::Compressed(p) => p.len(),
            DrawData::Scroll(_) | DrawData::Chunk(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One encoded region of a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawPacket {
    /// Window id.
    pub wid: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Encoding name ("rgb", "h264", "scroll", ...).
    pub encoding: String,
    /// Encoded data.
    pub data: DrawData,
    /// Per-connection packet sequence, assigned by the encode worker.
    pub packet_sequence: u64,
    /// Row stride of raw pixel data, 0 otherwise.
    pub rowstride: u32,
    /// Encoder-specific options.
    pub options: BTreeMap<String, OptionValue>,
}

impl DrawPacket {
    pub fn new(wid: u32, x: u32, y: u32, w: u32, h: u32, encoding: impl Into<String>, data: DrawData) -> Self {
        Self {
            wid,
            x,
            y,
            w,
            h,
            encoding: encoding.into(),
            data,
            packet_sequence: 0,
            rowstride: 0,
            options: BTreeMap::new(),
        }
    }

    /// Set an option, returning `self` for chaining.
    pub fn with_option(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn set_option(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.options.insert(key.to_string(), value.into());
    }

    pub fn int_option(&self, key: &str) -> Option<i64> {
        match self.options.get(key) {
            Some(OptionValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bool_option(&self, key: &str) -> bool {
        matches!(self.options.get(key), Some(OptionValue::Bool(true)))
    }

    pub fn str_option(&self, key: &str) -> Option<&str> {
        match self.options.get(key) {
            Some(OptionValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Remaining packets of the same damage batch (0 = last one).
    pub fn flush(&self) -> i64 {
        self.int_option(keys::FLUSH).unwrap_or(0)
    }

    /// Damage sequence this packet was produced for.
    pub fn damage_sequence(&self) -> Option<u64> {
        self.int_option(keys::DAMAGE_SEQUENCE).map(|v| v as u64)
    }
}

impl fmt::Display for DrawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "draw(wid={}, {}x{}@{},{}, {}, {} bytes, seq={})",
            self.wid,
            self.w,
            self.h,
            self.x,
            self.y,
            self.encoding,
            self.data.len(),
            self.packet_sequence
        )
    }
}

/// A packet on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Draw(DrawPacket),
    Disconnect { reason: String },
}

impl Packet {
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Packet::Disconnect { reason: reason.into() }
    }

    /// Short type name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Draw(_) => "draw",
            Packet::Disconnect { .. } => "disconnect",
        }
    }

    pub fn as_draw(&self) -> Option<&DrawPacket> {
        match self {
            Packet::Draw(d) => Some(d),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
