//! `tokio_util` codec for pixwire packets.
//!
//! ```text
//!   draw packet with a large / pre-compressed payload:
//!
//!   ┌────────────┬──────────────────┐┌────────────┬──────────────────────────┐
//!   │ hdr idx=1  │ payload bytes    ││ hdr idx=0  │ body (Chunk(1) in place) │
//!   └────────────┴──────────────────┘└────────────┴──────────────────────────┘
//! ```
//!
//! Raw chunks are sent ahead of the main packet so large pixel payloads
//! are never re-serialised or re-compressed. The decoder buffers chunks
//! until the index-0 packet arrives and substitutes them back.

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::compression::{self, Algorithm, CompressedPayload};
use crate::error::PixwireError;
use crate::flags::ProtocolFlags;
use crate::header::{HEADER_SIZE, MARKER, MAX_PACKET_SIZE, PacketHeader, find_header, pack_header, unpack_header};
use crate::packet::{DrawData, Packet};
use crate::policy::{CompressionPolicy, Serializer};

/// Option key carrying a chunked payload's datatype.
const CHUNK_DATATYPE: &str = "chunk-datatype";

/// Packet index used for the raw payload chunk of a draw packet.
const PAYLOAD_CHUNK: u8 = 1;

// ── FrameCodec ───────────────────────────────────────────────────

/// Framed encoder/decoder for [`Packet`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Main body serializer for outgoing packets.
    serializer: Serializer,
    /// Compression level for main bodies (0 = never).
    level: u8,
    /// Algorithms this side may use and accept.
    enabled: Vec<Algorithm>,
    /// Bodies up to this size are not compressed.
    min_compress_size: usize,
    /// Minimum compression gain.
    min_saving: usize,
    /// Payloads above this size are sent as raw chunks.
    inline_size: usize,
    /// Largest payload a header may declare.
    max_packet_size: u32,
    /// Skip to the next valid header instead of failing.
    resync: bool,
    /// Raw chunks waiting for their main packet.
    chunks: BTreeMap<u8, (u8, Vec<u8>)>,
}

impl FrameCodec {
    /// Codec with default compression settings.
    pub fn new() -> Self {
        Self::from_policy(&CompressionPolicy::default())
    }

    /// Codec configured from a compression policy.
    pub fn from_policy(policy: &CompressionPolicy) -> Self {
        Self {
            serializer: policy.serializer,
            level: policy.level,
            enabled: compression::parse_enabled(&policy.compressors),
            min_compress_size: policy.min_compress_size,
            min_saving: policy.min_saving,
            inline_size: policy.inline_size,
            max_packet_size: MAX_PACKET_SIZE,
            resync: false,
            chunks: BTreeMap::new(),
        }
    }

    /// Enable or disable header resynchronisation on corrupt input.
    pub fn with_resync(mut self, resync: bool) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_max_packet_size(mut self, max: u32) -> Self {
        self.max_packet_size = max.min(MAX_PACKET_SIZE);
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    // ── Internal ─────────────────────────────────────────────────

    fn serializer_flag(&self) -> ProtocolFlags {
        match self.serializer {
            Serializer::Bincode => ProtocolFlags::BINCODE,
            Serializer::Json => ProtocolFlags::JSON,
        }
    }

    fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, PixwireError> {
        Ok(match self.serializer {
            Serializer::Bincode => bincode::serialize(packet)?,
            Serializer::Json => serde_json::to_vec(packet)?,
        })
    }

    fn deserialize(flags: ProtocolFlags, body: &[u8]) -> Result<Packet, PixwireError> {
        if flags.contains(ProtocolFlags::JSON) {
            Ok(serde_json::from_slice(body)?)
        } else if flags.contains(ProtocolFlags::BINCODE) {
            Ok(bincode::deserialize(body)?)
        } else {
            Err(PixwireError::MalformedHeader("no serializer flag"))
        }
    }

    /// Validate a header, or report how many bytes to skip when resyncing.
    fn check_header(&self, src: &BytesMut, header: &PacketHeader) -> Result<Option<usize>, PixwireError> {
        let valid = header.marker == MARKER && header.is_plausible(header.index, u32::MAX);
        if valid {
            return Ok(None);
        }
        if !self.resync {
            return Err(PixwireError::MalformedHeader("invalid packet header"));
        }
        let skip = find_header(&src[1..], 0, self.max_packet_size)
            .map(|pos| pos + 1)
            .unwrap_or_else(|| src.len().saturating_sub(HEADER_SIZE - 1));
        tracing::warn!(skipped = skip, "corrupt packet header, resynchronising");
        Ok(Some(skip))
    }

    fn substitute_chunks(&mut self, packet: &mut Packet) -> Result<(), PixwireError> {
        if let Packet::Draw(draw) = packet {
            if let DrawData::Chunk(index) = draw.data {
                let (level, data) = self
                    .chunks
                    .remove(&index)
                    .ok_or(PixwireError::ProtocolViolation("draw packet refers to a missing chunk"))?;
                let datatype = match draw.options.remove(CHUNK_DATATYPE) {
                    Some(crate::packet::OptionValue::Str(s)) => s,
                    _ => draw.encoding.clone(),
                };
                draw.data = DrawData::Compressed(CompressedPayload {
                    datatype,
                    data,
                    level,
                    algorithm: Algorithm::from_level(level)?,
                    can_inline: false,
                });
            }
        }
        if !self.chunks.is_empty() {
            tracing::debug!(count = self.chunks.len(), "discarding unreferenced chunks");
            self.chunks.clear();
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

// ── Decoder ──────────────────────────────────────────────────────

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = PixwireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }
            let header = unpack_header(&src[..HEADER_SIZE])?;
            if let Some(skip) = self.check_header(src, &header)? {
                src.advance(skip);
                self.chunks.clear();
                continue;
            }
            if header.flags.contains(ProtocolFlags::CIPHER) {
                return Err(PixwireError::ProtocolViolation("encrypted packets are not supported"));
            }
            if header.size > self.max_packet_size {
                return Err(PixwireError::FrameTooLarge {
                    size: header.size as usize,
                    max: self.max_packet_size as usize,
                });
            }

            let total = HEADER_SIZE + header.size as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            src.advance(HEADER_SIZE);
            let payload = src.split_to(header.size as usize);

            if header.index > 0 {
                self.chunks.insert(header.index, (header.level, payload.to_vec()));
                continue;
            }

            let body = if header.level == 0 {
                payload.to_vec()
            } else {
                compression::decompress(&payload, header.level, &self.enabled)?
            };
            let mut packet = Self::deserialize(header.flags, &body)?;
            self.substitute_chunks(&mut packet)?;
            return Ok(Some(packet));
        }
    }
}

// ── Encoder ──────────────────────────────────────────────────────

impl Encoder<Packet> for FrameCodec {
    type Error = PixwireError;

    fn encode(&mut self, mut item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut flags = self.serializer_flag();

        if let Packet::Draw(draw) = &mut item {
            if draw.flush() > 0 {
                flags |= ProtocolFlags::FLUSH;
            }
            let chunk = match &draw.data {
                DrawData::Compressed(p) => !p.can_inline || p.len() > self.inline_size,
                _ => false,
            };
            if chunk {
                let data = std::mem::replace(&mut draw.data, DrawData::Chunk(PAYLOAD_CHUNK));
                if let DrawData::Compressed(payload) = data {
                    let size = payload.len();
                    if size > self.max_packet_size as usize {
                        return Err(PixwireError::FrameTooLarge {
                            size,
                            max: self.max_packet_size as usize,
                        });
                    }
                    draw.set_option(CHUNK_DATATYPE, payload.datatype.as_str());
                    dst.reserve(HEADER_SIZE + size);
                    dst.extend_from_slice(&pack_header(flags, payload.level, PAYLOAD_CHUNK, size as u32));
                    dst.extend_from_slice(&payload.data);
                }
            }
        }

        // Inlined payloads are already encoded, so they raise the threshold.
        let inline_len = match &item {
            Packet::Draw(draw) => draw.data.len(),
            _ => 0,
        };
        let body = self.serialize(&item)?;
        let wrapped = compression::compressed_wrapper_with(
            item.kind(),
            &body,
            self.level,
            &self.enabled,
            self.min_saving,
            self.min_compress_size + inline_len,
        )?;
        if wrapped.len() > self.max_packet_size as usize {
            return Err(PixwireError::FrameTooLarge {
                size: wrapped.len(),
                max: self.max_packet_size as usize,
            });
        }
        dst.reserve(HEADER_SIZE + wrapped.len());
        dst.extend_from_slice(&pack_header(flags, wrapped.level, 0, wrapped.len() as u32));
        dst.extend_from_slice(&wrapped.data);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DrawPacket, ScrollRect};

    fn draw(data: DrawData) -> Packet {
        Packet::Draw(DrawPacket::new(1, 0, 0, 64, 64, "rgb", data))
    }

    fn roundtrip(codec: &mut FrameCodec, packet: Packet) -> Packet {
        let mut buf = BytesMut::new();
        codec.encode(packet, &mut buf).unwrap();
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        out
    }

    #[test]
    fn small_packet_roundtrip() {
        let mut codec = FrameCodec::new();
        let p = draw(DrawData::Raw(vec![1, 2, 3]));
        assert_eq!(roundtrip(&mut codec, p.clone()), p);
    }

    #[test]
    fn json_serializer_roundtrip() {
        let mut codec = FrameCodec::new().with_serializer(Serializer::Json);
        let p = Packet::disconnect("bye");
        let mut buf = BytesMut::new();
        codec.encode(p.clone(), &mut buf).unwrap();
        assert_eq!(buf[1] & ProtocolFlags::JSON.bits(), ProtocolFlags::JSON.bits());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(p));
    }

    #[test]
    fn encoded_payload_travels_as_chunk() {
        let mut codec = FrameCodec::new();
        let payload = CompressedPayload::encoded("h264", vec![7u8; 1000]);
        let mut buf = BytesMut::new();
        codec.encode(draw(DrawData::Compressed(payload.clone())), &mut buf).unwrap();
        let first = unpack_header(&buf).unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(first.size, 1000);

        let out = codec.decode(&mut buf).unwrap().unwrap();
        let Packet::Draw(d) = out else { panic!("expected draw") };
        assert_eq!(d.data, DrawData::Compressed(payload));
        assert!(!d.options.contains_key(CHUNK_DATATYPE));
    }

    #[test]
    fn large_body_is_compressed() {
        let mut codec = FrameCodec::new();
        let rects = vec![ScrollRect::new(0, 0, 64, 16, 0, -8); 1000];
        let p = draw(DrawData::Scroll(rects));
        let mut buf = BytesMut::new();
        codec.encode(p.clone(), &mut buf).unwrap();
        let header = unpack_header(&buf).unwrap();
        assert_ne!(header.level, 0);
        assert!((header.size as usize) < 20_000);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(p));
    }

    #[test]
    fn inline_payload_raises_compression_threshold() {
        let mut codec = FrameCodec::new();
        let p = draw(DrawData::Raw(vec![0u8; 2000]));
        let mut buf = BytesMut::new();
        codec.encode(p.clone(), &mut buf).unwrap();
        let header = unpack_header(&buf).unwrap();
        assert_eq!(header.level, 0);
        assert!(header.size as usize > 2000);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(p));
    }

    #[test]
    fn partial_input_waits() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Packet::disconnect("x"), &mut full).unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_packet_rejected() {
        let mut codec = FrameCodec::new().with_max_packet_size(16);
        let mut buf = BytesMut::from(&pack_header(ProtocolFlags::BINCODE, 0, 0, 17)[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PixwireError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn cipher_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&pack_header(ProtocolFlags::BINCODE | ProtocolFlags::CIPHER, 0, 0, 0)[..]);
        assert!(matches!(codec.decode(&mut buf), Err(PixwireError::ProtocolViolation(_))));
    }

    #[test]
    fn garbage_is_malformed_without_resync() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"garbage!garbage!"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(PixwireError::MalformedHeader(_))));
    }

    #[test]
    fn resync_skips_garbage() {
        let mut codec = FrameCodec::new().with_resync(true);
        let mut buf = BytesMut::from(&b"junkjunk"[..]);
        codec.encode(Packet::disconnect("after junk"), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::disconnect("after junk")));
    }

    #[test]
    fn missing_chunk_is_a_violation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(draw(DrawData::Chunk(3)), &mut buf).unwrap();
        assert!(matches!(codec.decode(&mut buf), Err(PixwireError::ProtocolViolation(_))));
    }
}
