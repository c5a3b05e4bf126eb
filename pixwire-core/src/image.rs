//! Captured pixel buffers.
//!
//! A [`Frame`] is produced by the capture collaborator ([`FrameSource`])
//! for each damage event. Frames whose backing memory the capture side may
//! recycle are created with `thread_safe = false` and must be
//! [`freeze`](Frame::freeze)d before they cross to the encode thread.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EncodeError;
use crate::region::Rectangle;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    Bgrx,
    Bgra,
    Rgbx,
    Rgba,
    Rgb,
    Bgr,
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Bgrx | PixelFormat::Bgra | PixelFormat::Rgbx | PixelFormat::Rgba => Some(4),
            PixelFormat::Rgb | PixelFormat::Bgr => Some(3),
            _ => None,
        }
    }

    /// Packed RGB variants.
    pub fn is_rgb(self) -> bool {
        self.bytes_per_pixel().is_some()
    }

    /// Formats that lose chroma resolution.
    pub fn is_subsampled(self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Nv12)
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Bgra | PixelFormat::Rgba)
    }

    /// Number of planes.
    pub fn planes(self) -> usize {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => 3,
            PixelFormat::Nv12 => 2,
            _ => 1,
        }
    }

    /// Chroma (x, y) divisors for planar formats.
    pub fn chroma_divisors(self) -> (u32, u32) {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => (2, 2),
            PixelFormat::Yuv422p => (2, 1),
            _ => (1, 1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Bgrx => "BGRX",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Rgbx => "RGBX",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
            PixelFormat::Yuv420p => "YUV420P",
            PixelFormat::Yuv422p => "YUV422P",
            PixelFormat::Yuv444p => "YUV444P",
            PixelFormat::Nv12 => "NV12",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "BGRX" => PixelFormat::Bgrx,
            "BGRA" => PixelFormat::Bgra,
            "RGBX" => PixelFormat::Rgbx,
            "RGBA" => PixelFormat::Rgba,
            "RGB" => PixelFormat::Rgb,
            "BGR" => PixelFormat::Bgr,
            "YUV420P" => PixelFormat::Yuv420p,
            "YUV422P" => PixelFormat::Yuv422p,
            "YUV444P" => PixelFormat::Yuv444p,
            "NV12" => PixelFormat::Nv12,
            other => return Err(format!("unknown pixel format: {other}")),
        })
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// One plane of pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    /// Bytes per row.
    pub stride: u32,
    /// Row data; `stride * rows` bytes (the last row may be short).
    pub data: Bytes,
}

/// A captured (or converted) pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Target x offset within the window.
    pub x: u32,
    /// Target y offset within the window.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Bits per pixel of colour information (24, 30, 32).
    pub depth: u8,
    /// One entry per plane.
    pub planes: Vec<Plane>,
    /// Whether the backing memory may be read from another thread.
    thread_safe: bool,
}

impl Frame {
    /// A packed single-plane frame.
    pub fn packed(
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: u32,
        data: impl Into<Bytes>,
    ) -> Self {
        let depth = if format.has_alpha() { 32 } else { 24 };
        Self {
            x,
            y,
            width,
            height,
            format,
            depth,
            planes: vec![Plane {
                stride,
                data: data.into(),
            }],
            thread_safe: true,
        }
    }

    /// A planar frame.
    pub fn planar(width: u32, height: u32, format: PixelFormat, planes: Vec<Plane>) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            format,
            depth: 24,
            planes,
            thread_safe: true,
        }
    }

    /// Mark the frame as aliasing memory owned by the capture backend.
    pub fn borrowed(mut self) -> Self {
        self.thread_safe = false;
        self
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Deep-copy the pixel data so the capture side can reuse its buffer.
    pub fn freeze(&mut self) {
        if self.thread_safe {
            return;
        }
        for plane in &mut self.planes {
            plane.data = Bytes::copy_from_slice(&plane.data);
        }
        self.thread_safe = true;
    }

    /// Row stride of the first plane.
    pub fn rowstride(&self) -> u32 {
        self.planes.first().map(|p| p.stride).unwrap_or(0)
    }

    /// Pixel bytes of the first plane.
    pub fn pixels(&self) -> &[u8] {
        self.planes.first().map(|p| p.data.as_ref()).unwrap_or(&[])
    }

    /// Geometry as a rectangle.
    pub fn rect(&self) -> Rectangle {
        Rectangle::new(self.x, self.y, self.width, self.height)
    }

    /// Verify that the planes hold enough bytes for the geometry.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.planes.len() != self.format.planes() {
            return Err(EncodeError::InvalidFrame(format!(
                "{} expects {} planes, got {}",
                self.format,
                self.format.planes(),
                self.planes.len()
            )));
        }
        for (i, plane) in self.planes.iter().enumerate() {
            let (w, h) = self.plane_size(i);
            let row = self.plane_row_bytes(i, w);
            if h == 0 {
                continue;
            }
            let needed = plane.stride as usize * (h as usize - 1) + row;
            if (plane.stride as usize) < row || plane.data.len() < needed {
                return Err(EncodeError::InvalidFrame(format!(
                    "plane {i}: {} bytes for {w}x{h} stride {}",
                    plane.data.len(),
                    plane.stride
                )));
            }
        }
        Ok(())
    }

    /// Zero-copy view of part of a packed frame.
    ///
    /// Coordinates are relative to the frame; the result keeps the parent
    /// stride and gets a target offset of `self.x + x`, `self.y + y`.
    pub fn get_sub_image(&self, x: u32, y: u32, w: u32, h: u32) -> Result<Frame, EncodeError> {
        let bpp = self
            .format
            .bytes_per_pixel()
            .ok_or_else(|| EncodeError::InvalidFrame(format!("cannot slice planar {}", self.format)))?;
        if w == 0 || h == 0 || x + w > self.width || y + h > self.height {
            return Err(EncodeError::InvalidFrame(format!(
                "sub image {w}x{h}@{x},{y} outside {}x{}",
                self.width, self.height
            )));
        }
        let plane = self
            .planes
            .first()
            .ok_or_else(|| EncodeError::InvalidFrame("frame has no pixel plane".into()))?;
        let stride = plane.stride as usize;
        let start = y as usize * stride + x as usize * bpp;
        let end = start + (h as usize - 1) * stride + w as usize * bpp;
        if end > plane.data.len() {
            return Err(EncodeError::InvalidFrame("sub image exceeds buffer".into()));
        }
        Ok(Frame {
            x: self.x + x,
            y: self.y + y,
            width: w,
            height: h,
            format: self.format,
            depth: self.depth,
            planes: vec![Plane {
                stride: plane.stride,
                data: plane.data.slice(start..end),
            }],
            thread_safe: self.thread_safe,
        })
    }

    /// Tightly packed copy of a packed frame (`stride == width * bpp`).
    pub fn restride(&self) -> Result<Frame, EncodeError> {
        let bpp = self
            .format
            .bytes_per_pixel()
            .ok_or_else(|| EncodeError::InvalidFrame(format!("cannot restride planar {}", self.format)))?;
        let row = self.width as usize * bpp;
        if self.rowstride() as usize == row {
            return Ok(self.clone());
        }
        self.validate()?;
        let src = self.pixels();
        let stride = self.rowstride() as usize;
        let mut out = Vec::with_capacity(row * self.height as usize);
        for y in 0..self.height as usize {
            out.extend_from_slice(&src[y * stride..y * stride + row]);
        }
        Ok(Frame {
            planes: vec![Plane {
                stride: row as u32,
                data: Bytes::from(out),
            }],
            thread_safe: true,
            ..self.clone()
        })
    }

    /// Dimensions of plane `i`.
    pub fn plane_size(&self, i: usize) -> (u32, u32) {
        if i == 0 {
            return (self.width, self.height);
        }
        let (dx, dy) = self.format.chroma_divisors();
        (self.width.div_ceil(dx), self.height.div_ceil(dy))
    }

    fn plane_row_bytes(&self, i: usize, w: u32) -> usize {
        match (self.format, i) {
            (f, _) if f.is_rgb() => w as usize * f.bytes_per_pixel().unwrap_or(4),
            (PixelFormat::Nv12, 1) => w as usize * 2,
            _ => w as usize,
        }
    }
}

// ── FrameSource ──────────────────────────────────────────────────

/// Capture collaborator: supplies pixels for a window.
pub trait FrameSource: Send {
    /// Current window size.
    fn dimensions(&self) -> (u32, u32);

    /// Capture the given window area, or `None` if the window is gone.
    fn get_image(&mut self, rect: Rectangle) -> Option<Frame>;
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32, pad: u32) -> Frame {
        let stride = w * 4 + pad;
        let mut data = vec![0u8; (stride * h) as usize];
        for y in 0..h {
            for x in 0..w {
                let o = (y * stride + x * 4) as usize;
                data[o] = x as u8;
                data[o + 1] = y as u8;
            }
        }
        Frame::packed(0, 0, w, h, PixelFormat::Bgrx, stride, data)
    }

    #[test]
    fn format_properties() {
        assert_eq!(PixelFormat::Bgrx.bytes_per_pixel(), Some(4));
        assert_eq!(PixelFormat::Yuv420p.planes(), 3);
        assert!(PixelFormat::Nv12.is_subsampled());
        assert!(!PixelFormat::Yuv444p.is_subsampled());
        assert_eq!("yuv420p".parse::<PixelFormat>().unwrap(), PixelFormat::Yuv420p);
        assert!("XYZ".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn sub_image_is_zero_copy_and_offset() {
        let f = gradient(16, 16, 8);
        let sub = f.get_sub_image(4, 5, 8, 3).unwrap();
        assert_eq!((sub.x, sub.y, sub.width, sub.height), (4, 5, 8, 3));
        assert_eq!(sub.rowstride(), f.rowstride());
        assert_eq!(sub.pixels()[0], 4);
        assert_eq!(sub.pixels()[1], 5);
        assert!(f.get_sub_image(10, 0, 8, 1).is_err());
    }

    #[test]
    fn sub_image_of_planeless_frame_is_an_error() {
        let mut f = gradient(16, 16, 0);
        f.planes.clear();
        assert!(matches!(f.get_sub_image(0, 0, 4, 4), Err(EncodeError::InvalidFrame(_))));
    }

    #[test]
    fn restride_packs_rows() {
        let f = gradient(5, 3, 12);
        let r = f.restride().unwrap();
        assert_eq!(r.rowstride(), 20);
        assert_eq!(r.pixels().len(), 60);
        assert_eq!(r.pixels()[20 + 4], 1);
        assert_eq!(r.pixels()[20 + 5], 1);
    }

    #[test]
    fn freeze_copies_borrowed_frames() {
        let mut f = gradient(4, 4, 0).borrowed();
        assert!(!f.is_thread_safe());
        let before = f.pixels().to_vec();
        f.freeze();
        assert!(f.is_thread_safe());
        assert_eq!(f.pixels(), before.as_slice());
    }

    #[test]
    fn validate_detects_short_buffers() {
        let f = Frame::packed(0, 0, 10, 10, PixelFormat::Bgrx, 40, vec![0u8; 100]);
        assert!(f.validate().is_err());
        assert!(gradient(10, 10, 0).validate().is_ok());
    }
}
