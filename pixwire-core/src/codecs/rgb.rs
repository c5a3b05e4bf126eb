//! Raw `rgb` picture encoder.
//!
//! Sends the pixels themselves, restrided and compressed with the
//! connection's payload compressor. Opaque 32-bit frames are reduced to
//! 24 bits first.

use std::collections::BTreeMap;

use super::{PictureEncoder, PictureOutput, PictureParams};
use crate::compression;
use crate::error::EncodeError;
use crate::image::{Frame, PixelFormat};
use crate::packet::{DrawData, OptionValue};

/// Encoding name.
pub const ENCODING: &str = "rgb";

/// Option key naming the pixel layout of the payload.
pub const RGB_FORMAT: &str = "rgb_format";

/// The `rgb` encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RgbEncoder;

impl RgbEncoder {
    /// Whether every alpha byte is 0xFF.
    fn is_opaque(pixels: &[u8]) -> bool {
        pixels.chunks_exact(4).all(|p| p[3] == 0xFF)
    }

    /// Drop the fourth byte of every pixel.
    fn strip_alpha(pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pixels.len() / 4 * 3);
        for p in pixels.chunks_exact(4) {
            out.extend_from_slice(&p[..3]);
        }
        out
    }

    fn packed_24(format: PixelFormat) -> PixelFormat {
        match format {
            PixelFormat::Rgbx | PixelFormat::Rgba => PixelFormat::Rgb,
            _ => PixelFormat::Bgr,
        }
    }
}

impl PictureEncoder for RgbEncoder {
    fn encoding(&self) -> &str {
        ENCODING
    }

    fn encode(&self, frame: &Frame, params: &PictureParams) -> Result<PictureOutput, EncodeError> {
        let bpp = frame
            .format
            .bytes_per_pixel()
            .ok_or_else(|| EncodeError::Unsupported(format!("{ENCODING} cannot encode {}", frame.format)))?;
        let frame = frame.restride()?;
        let pixels = frame.pixels();

        let strip = bpp == 4 && (!frame.format.has_alpha() || Self::is_opaque(pixels));
        let (datatype, format, data, bpp) = if strip {
            ("rgb24", Self::packed_24(frame.format), Self::strip_alpha(pixels), 3)
        } else if bpp == 4 {
            ("rgb32", frame.format, pixels.to_vec(), 4)
        } else {
            ("rgb24", frame.format, pixels.to_vec(), 3)
        };

        let payload = compression::compressed_wrapper(
            datatype,
            &data,
            params.level,
            &params.compressors,
            params.min_saving,
        )
        .map_err(|e| EncodeError::Codec {
            codec: ENCODING.into(),
            reason: e.to_string(),
        })?;

        let mut options = BTreeMap::new();
        options.insert(RGB_FORMAT.to_string(), OptionValue::Str(format.name().to_string()));
        Ok(PictureOutput {
            data: DrawData::Compressed(payload),
            rowstride: frame.width * bpp,
            options,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
