//! Codec capability registry.
//!
//! Concrete converters and encoders are never named by the pipeline. Each
//! backend registers a descriptor ([`CscSpec`] / [`EncoderSpec`]) with its
//! limits and costs plus a factory that builds instances on demand. The
//! scorer only looks at descriptors; the pipeline only talks to the
//! instance traits.
//!
//! ```text
//!   CodecRegistry
//!     csc:      src format ─▶ dst format ─▶ [CscSpec]
//!     encoders: encoding   ─▶ input fmt  ─▶ [EncoderSpec]
//!     pictures: encoding   ─▶ PictureEncoder
//! ```

pub mod csc_soft;
pub mod rgb;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::caps::ClientCapabilities;
use crate::compression::Algorithm;
use crate::error::EncodeError;
use crate::image::{Frame, PixelFormat};
use crate::packet::{DrawData, OptionValue};

// ── Instance traits ──────────────────────────────────────────────

/// A colourspace converter instance, bound to fixed geometry.
pub trait ColorspaceConverter: Send {
    /// Convert (and possibly scale) one frame.
    fn convert(&mut self, frame: &Frame) -> Result<Frame, EncodeError>;
    fn name(&self) -> &str;
    fn src_format(&self) -> PixelFormat;
    fn dst_format(&self) -> PixelFormat;
    fn src_size(&self) -> (u32, u32);
    fn dst_size(&self) -> (u32, u32);
    fn is_closed(&self) -> bool;
    /// Release resources; the instance is unusable afterwards.
    fn clean(&mut self);
}

/// Output of one video encoder call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderOutput {
    /// Bitstream, or `None` when the frame was buffered.
    pub data: Option<Vec<u8>>,
    /// Frame number of the emitted data.
    pub frame: u64,
    /// Frames still held back by the encoder (B-frames).
    pub delayed: u32,
    /// Codec-specific client options.
    pub options: BTreeMap<String, OptionValue>,
}

/// A video encoder instance, bound to fixed geometry and input format.
pub trait VideoEncoder: Send {
    fn compress(&mut self, frame: &Frame, quality: u8, speed: u8) -> Result<EncoderOutput, EncodeError>;
    /// Emit buffered frames, if any.
    fn flush(&mut self, frame_no: u64) -> Result<EncoderOutput, EncodeError>;
    fn delayed_frames(&self) -> u32;
    fn encoding(&self) -> &str;
    fn codec_type(&self) -> &str;
    fn src_format(&self) -> PixelFormat;
    fn size(&self) -> (u32, u32);
    fn is_closed(&self) -> bool;
    fn clean(&mut self);
}

/// Settings passed to a picture encoder.
#[derive(Debug, Clone)]
pub struct PictureParams {
    pub quality: u8,
    pub speed: u8,
    /// Enabled compressors for the pixel payload.
    pub compressors: Vec<Algorithm>,
    pub level: u8,
    pub min_saving: usize,
}

/// Output of a picture encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct PictureOutput {
    pub data: DrawData,
    pub rowstride: u32,
    pub options: BTreeMap<String, OptionValue>,
}

/// Stateless encoder for non-video encodings.
pub trait PictureEncoder: Send + Sync {
    fn encoding(&self) -> &str;
    fn encode(&self, frame: &Frame, params: &PictureParams) -> Result<PictureOutput, EncodeError>;
}

// ── Factories ────────────────────────────────────────────────────

/// Builds converter instances.
pub trait CscFactory: Send + Sync {
    fn create(
        &self,
        src: (u32, u32, PixelFormat),
        dst: (u32, u32, PixelFormat),
        speed: u8,
    ) -> Result<Box<dyn ColorspaceConverter>, EncodeError>;
}

/// Parameters for a new video encoder instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub encoding: String,
    pub width: u32,
    pub height: u32,
    pub src_format: PixelFormat,
    /// Output formats the client accepts.
    pub dst_formats: Vec<PixelFormat>,
    pub quality: u8,
    pub speed: u8,
    pub scaling: (u32, u32),
}

/// Builds video encoder instances.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, params: &EncoderParams) -> Result<Box<dyn VideoEncoder>, EncodeError>;
}

// ── Descriptors ──────────────────────────────────────────────────

/// Describes one colourspace conversion path.
#[derive(Clone)]
pub struct CscSpec {
    pub name: String,
    pub input_format: PixelFormat,
    pub output_format: PixelFormat,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub width_mask: u32,
    pub height_mask: u32,
    pub can_scale: bool,
    /// Output quality, 0-100.
    pub quality: u8,
    /// Relative speed, 0-100.
    pub speed: u8,
    pub setup_cost: u32,
    pub cpu_cost: u32,
    pub gpu_cost: u32,
    pub factory: Arc<dyn CscFactory>,
}

/// Describes one video encoder for one input format.
#[derive(Clone)]
pub struct EncoderSpec {
    /// Backend name ("x264", "nvenc", ...).
    pub codec_type: String,
    /// Encoding produced ("h264", "vp8", ...).
    pub encoding: String,
    pub input_format: PixelFormat,
    pub output_formats: Vec<PixelFormat>,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub width_mask: u32,
    pub height_mask: u32,
    pub can_scale: bool,
    pub has_lossless_mode: bool,
    pub quality: u8,
    pub speed: u8,
    pub setup_cost: u32,
    pub cpu_cost: u32,
    pub gpu_cost: u32,
    pub factory: Arc<dyn EncoderFactory>,
}

impl CscSpec {
    /// Whether the converter accepts `w x h` input.
    pub fn accepts_size(&self, w: u32, h: u32) -> bool {
        w >= self.min_width && h >= self.min_height && w <= self.max_width && h <= self.max_height
    }
}

impl EncoderSpec {
    pub fn accepts_size(&self, w: u32, h: u32) -> bool {
        w >= self.min_width && h >= self.min_height && w <= self.max_width && h <= self.max_height
    }

    /// Apply the dimension masks.
    pub fn masked(&self, w: u32, h: u32) -> (u32, u32) {
        (w & self.width_mask, h & self.height_mask)
    }
}

impl fmt::Debug for CscSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CscSpec")
            .field("name", &self.name)
            .field("input", &self.input_format)
            .field("output", &self.output_format)
            .field("can_scale", &self.can_scale)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for EncoderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderSpec")
            .field("codec_type", &self.codec_type)
            .field("encoding", &self.encoding)
            .field("input", &self.input_format)
            .field("outputs", &self.output_formats)
            .finish_non_exhaustive()
    }
}

// ── CodecRegistry ────────────────────────────────────────────────

/// All known converters and encoders.
///
/// Built once per process; [`for_client`](Self::for_client) derives the
/// per-connection view.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    csc: BTreeMap<PixelFormat, BTreeMap<PixelFormat, Vec<Arc<CscSpec>>>>,
    encoders: BTreeMap<String, BTreeMap<PixelFormat, Vec<Arc<EncoderSpec>>>>,
    video_order: Vec<String>,
    pictures: BTreeMap<String, Arc<dyn PictureEncoder>>,
    picture_order: Vec<String>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in software converter and `rgb` encoder.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        for spec in csc_soft::specs() {
            reg.add_csc(spec);
        }
        reg.add_picture_encoder(Arc::new(rgb::RgbEncoder));
        reg
    }

    pub fn add_csc(&mut self, spec: CscSpec) {
        self.csc
            .entry(spec.input_format)
            .or_default()
            .entry(spec.output_format)
            .or_default()
            .push(Arc::new(spec));
    }

    pub fn add_encoder(&mut self, spec: EncoderSpec) {
        if !self.video_order.contains(&spec.encoding) {
            self.video_order.push(spec.encoding.clone());
        }
        self.encoders
            .entry(spec.encoding.clone())
            .or_default()
            .entry(spec.input_format)
            .or_default()
            .push(Arc::new(spec));
    }

    pub fn add_picture_encoder(&mut self, encoder: Arc<dyn PictureEncoder>) {
        let name = encoder.encoding().to_string();
        if !self.picture_order.contains(&name) {
            self.picture_order.push(name.clone());
        }
        self.pictures.insert(name, encoder);
    }

    /// Encoder specs for `encoding`, keyed by input format.
    pub fn encoder_specs(&self, encoding: &str) -> BTreeMap<PixelFormat, Vec<Arc<EncoderSpec>>> {
        self.encoders.get(encoding).cloned().unwrap_or_default()
    }

    /// Converter specs from `src_format`, keyed by output format.
    pub fn csc_specs(&self, src_format: PixelFormat) -> BTreeMap<PixelFormat, Vec<Arc<CscSpec>>> {
        self.csc.get(&src_format).cloned().unwrap_or_default()
    }

    /// Video encodings, in registration order.
    pub fn video_encodings(&self) -> Vec<String> {
        self.video_order.clone()
    }

    /// Picture encodings, in registration order.
    pub fn picture_encodings(&self) -> Vec<String> {
        self.picture_order.clone()
    }

    pub fn is_video_encoding(&self, encoding: &str) -> bool {
        self.encoders.contains_key(encoding)
    }

    pub fn picture_encoder(&self, encoding: &str) -> Option<Arc<dyn PictureEncoder>> {
        self.pictures.get(encoding).cloned()
    }

    /// The per-connection view: only what the client can decode.
    pub fn for_client(&self, caps: &ClientCapabilities) -> CodecRegistry {
        let mut out = CodecRegistry {
            csc: self.csc.clone(),
            ..Default::default()
        };
        for encoding in &self.video_order {
            if !caps.accepts_encoding(encoding) {
                continue;
            }
            let Some(by_input) = self.encoders.get(encoding) else {
                continue;
            };
            for specs in by_input.values() {
                for spec in specs {
                    if spec.output_formats.iter().any(|f| caps.accepts_csc(encoding, *f)) {
                        if !out.video_order.contains(encoding) {
                            out.video_order.push(encoding.clone());
                        }
                        out.encoders
                            .entry(encoding.clone())
                            .or_default()
                            .entry(spec.input_format)
                            .or_default()
                            .push(Arc::clone(spec));
                    } else {
                        tracing::debug!(
                            encoding = %encoding,
                            codec = %spec.codec_type,
                            "client cannot decode any output format"
                        );
                    }
                }
            }
        }
        for encoding in &self.picture_order {
            if caps.accepts_encoding(encoding) {
                if let Some(enc) = self.pictures.get(encoding) {
                    out.picture_order.push(encoding.clone());
                    out.pictures.insert(encoding.clone(), Arc::clone(enc));
                }
            }
        }
        out
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("video", &self.video_order)
            .field("pictures", &self.picture_order)
            .field("csc_sources", &self.csc.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
