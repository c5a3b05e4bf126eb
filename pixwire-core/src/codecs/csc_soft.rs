//! Software RGB to YUV conversion (BT.601, limited range).
//!
//! Slow but always available. Converts 32-bit packed RGB to planar
//! YUV420P or YUV444P without scaling.

use std::sync::Arc;

use bytes::Bytes;

use super::{ColorspaceConverter, CscFactory, CscSpec};
use crate::error::EncodeError;
use crate::image::{Frame, PixelFormat, Plane};

const NAME: &str = "soft";

const INPUTS: [PixelFormat; 4] = [PixelFormat::Bgrx, PixelFormat::Bgra, PixelFormat::Rgbx, PixelFormat::Rgba];
const OUTPUTS: [PixelFormat; 2] = [PixelFormat::Yuv420p, PixelFormat::Yuv444p];

/// Descriptors for every supported input/output pair.
pub fn specs() -> Vec<CscSpec> {
    let factory: Arc<dyn CscFactory> = Arc::new(SoftCscFactory);
    let mut out = Vec::with_capacity(INPUTS.len() * OUTPUTS.len());
    for input in INPUTS {
        for output in OUTPUTS {
            let mask = if output.is_subsampled() { !1 } else { !0 };
            out.push(CscSpec {
                name: NAME.into(),
                input_format: input,
                output_format: output,
                min_width: 2,
                min_height: 2,
                max_width: 16384,
                max_height: 16384,
                width_mask: mask,
                height_mask: mask,
                can_scale: false,
                quality: if output.is_subsampled() { 50 } else { 100 },
                speed: 20,
                setup_cost: 0,
                cpu_cost: 100,
                gpu_cost: 0,
                factory: Arc::clone(&factory),
            });
        }
    }
    out
}

struct SoftCscFactory;

impl CscFactory for SoftCscFactory {
    fn create(
        &self,
        src: (u32, u32, PixelFormat),
        dst: (u32, u32, PixelFormat),
        _speed: u8,
    ) -> Result<Box<dyn ColorspaceConverter>, EncodeError> {
        let init_err = |reason: String| EncodeError::CodecInit {
            codec: NAME.into(),
            reason,
        };
        if (src.0, src.1) != (dst.0, dst.1) {
            return Err(init_err(format!(
                "cannot scale {}x{} to {}x{}",
                src.0, src.1, dst.0, dst.1
            )));
        }
        if !INPUTS.contains(&src.2) || !OUTPUTS.contains(&dst.2) {
            return Err(init_err(format!("unsupported conversion {} to {}", src.2, dst.2)));
        }
        Ok(Box::new(SoftConverter {
            src_format: src.2,
            dst_format: dst.2,
            width: src.0,
            height: src.1,
            closed: false,
        }))
    }
}

/// One converter instance.
pub struct SoftConverter {
    src_format: PixelFormat,
    dst_format: PixelFormat,
    width: u32,
    height: u32,
    closed: bool,
}

impl SoftConverter {
    /// Byte offsets of (r, g, b) within a pixel.
    fn rgb_offsets(&self) -> (usize, usize, usize) {
        match self.src_format {
            PixelFormat::Rgbx | PixelFormat::Rgba => (0, 1, 2),
            _ => (2, 1, 0),
        }
    }
}

#[inline]
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn rgb_to_u(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

#[inline]
fn rgb_to_v(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

impl ColorspaceConverter for SoftConverter {
    fn convert(&mut self, frame: &Frame) -> Result<Frame, EncodeError> {
        if self.closed {
            return Err(EncodeError::Closed(NAME.into()));
        }
        if frame.format != self.src_format || frame.width != self.width || frame.height != self.height {
            return Err(EncodeError::InvalidFrame(format!(
                "{NAME} expects {} {}x{}, got {} {}x{}",
                self.src_format, self.width, self.height, frame.format, frame.width, frame.height
            )));
        }
        frame.validate()?;

        let (w, h) = (self.width as usize, self.height as usize);
        let stride = frame.rowstride() as usize;
        let src = frame.pixels();
        let (ro, go, bo) = self.rgb_offsets();
        let px = |x: usize, y: usize| -> (i32, i32, i32) {
            let o = y * stride + x * 4;
            (src[o + ro] as i32, src[o + go] as i32, src[o + bo] as i32)
        };

        let mut yp = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                let (r, g, b) = px(x, y);
                yp[y * w + x] = rgb_to_y(r, g, b);
            }
        }

        let (cw, ch) = if self.dst_format == PixelFormat::Yuv420p {
            (w.div_ceil(2), h.div_ceil(2))
        } else {
            (w, h)
        };
        let mut up = vec![0u8; cw * ch];
        let mut vp = vec![0u8; cw * ch];
        for cy in 0..ch {
            for cx in 0..cw {
                let (r, g, b) = if self.dst_format == PixelFormat::Yuv420p {
                    let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
                    for (x, y) in [(2 * cx, 2 * cy), (2 * cx + 1, 2 * cy), (2 * cx, 2 * cy + 1), (2 * cx + 1, 2 * cy + 1)] {
                        if x < w && y < h {
                            let p = px(x, y);
                            r += p.0;
                            g += p.1;
                            b += p.2;
                            n += 1;
                        }
                    }
                    (r / n, g / n, b / n)
                } else {
                    px(cx, cy)
                };
                up[cy * cw + cx] = rgb_to_u(r, g, b);
                vp[cy * cw + cx] = rgb_to_v(r, g, b);
            }
        }

        let mut out = Frame::planar(
            self.width,
            self.height,
            self.dst_format,
            vec![
                Plane {
                    stride: w as u32,
                    data: Bytes::from(yp),
                },
                Plane {
                    stride: cw as u32,
                    data: Bytes::from(up),
                },
                Plane {
                    stride: cw as u32,
                    data: Bytes::from(vp),
                },
            ],
        );
        out.x = frame.x;
        out.y = frame.y;
        Ok(out)
    }

    fn name(&self) -> &str {
        NAME
    }

    fn src_format(&self) -> PixelFormat {
        self.src_format
    }

    fn dst_format(&self) -> PixelFormat {
        self.dst_format
    }

    fn src_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn dst_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn clean(&mut self) {
        self.closed = true;
    }
}

// ── Tests ────────────────────────────────────────────────────────
