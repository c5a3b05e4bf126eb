//! # pixwire-core
//!
//! Adaptive picture/video encoding pipeline and wire framing for remote
//! display servers.
//!
//! This crate contains:
//! - **Wire**: `PacketHeader`, `ProtocolFlags`, `FrameCodec` for framed TCP I/O via `tokio_util`
//! - **Compression**: the lz4/zstd registry and `CompressedPayload`
//! - **Packets**: `Packet`, `DrawPacket`, `DrawData`
//! - **Codecs**: `CodecRegistry` with capability descriptors and factories
//! - **Video**: scoring, scaling, subregion and scroll detection, the
//!   capture-side `WindowSource` and encode-side `WindowVideoEncoder`
//! - **Worker / Session**: the encode thread, output queue and writer
//! - **Error**: `PixwireError` and `EncodeError`, typed `thiserror` hierarchies

pub mod caps;
pub mod codec;
pub mod codecs;
pub mod compression;
pub mod error;
pub mod flags;
pub mod header;
pub mod image;
pub mod packet;
pub mod policy;
pub mod region;
pub mod session;
pub mod video;
pub mod worker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use caps::ClientCapabilities;
pub use codec::FrameCodec;
pub use codecs::{CodecRegistry, CscSpec, EncoderSpec};
pub use compression::{Algorithm, CompressedPayload};
pub use error::{EncodeError, PixwireError};
pub use flags::ProtocolFlags;
pub use header::{HEADER_SIZE, PacketHeader};
pub use image::{Frame, FrameSource, PixelFormat, Plane};
pub use packet::{DrawData, DrawPacket, Packet, ScrollRect};
pub use policy::PipelinePolicy;
pub use region::Rectangle;
pub use session::{OutputQueue, OutputReceiver, Session, SessionEvent, output_queue, run_writer};
pub use video::cancel::SequenceGate;
pub use video::pipeline::{EncoderState, WindowVideoEncoder};
pub use video::source::{DamageOptions, EncodeOptions, EncodeQueueItem, WindowSource};
pub use worker::{EncodeWorker, WorkItem};
