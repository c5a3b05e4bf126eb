//! Synthetic capture: a test-pattern window.
//!
//! | Mode     | Content                                  | Damage per tick            |
//! |----------|------------------------------------------|----------------------------|
//! | `Scroll` | rows scroll upwards, like a text view    | whole window               |
//! | `Band`   | static background, moving coloured band  | the band's horizontal strip |
//!
//! The pattern offset is derived from the time since creation, so the
//! source needs no tick from the damage feeder.

use std::time::{Duration, Instant};

use pixwire_core::{Frame, FrameSource, PixelFormat, Rectangle};

/// Pattern animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMode {
    Scroll,
    Band,
}

/// Clamped capture settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u8,
    pub mode: PatternMode,
    /// Pixels per second.
    pub speed: u32,
}

impl CaptureConfig {
    /// Time between two damage events.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }
}

/// A `FrameSource` drawing the pattern into BGRX frames.
#[derive(Debug, Clone)]
pub struct TestPattern {
    config: CaptureConfig,
    started: Instant,
    frozen: Option<u32>,
}

impl TestPattern {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            frozen: None,
        }
    }

    /// Pin the animation at `offset` pixels.
    pub fn frozen_at(mut self, offset: u32) -> Self {
        self.frozen = Some(offset);
        self
    }

    pub fn offset(&self) -> u32 {
        match self.frozen {
            Some(o) => o,
            None => {
                let ms = self.started.elapsed().as_millis() as u64;
                (ms * u64::from(self.config.speed) / 1000) as u32
            }
        }
    }

    /// Area changed by one animation step.
    pub fn damage_rect(&self) -> Rectangle {
        match self.config.mode {
            PatternMode::Scroll => Rectangle::new(0, 0, self.config.width, self.config.height),
            PatternMode::Band => {
                let (y, h) = self.band_rows();
                Rectangle::new(0, y, self.config.width, h)
            }
        }
    }

    fn band_rows(&self) -> (u32, u32) {
        let h = (self.config.height / 3).max(1);
        (self.config.height / 3, h)
    }

    fn pixel(&self, offset: u32, x: u32, y: u32) -> [u8; 4] {
        match self.config.mode {
            PatternMode::Scroll => {
                let row = y.wrapping_add(offset);
                let line = row / 16;
                // Glyph-ish blocks on alternating line backgrounds.
                let ink = (x / 8 + line * 3) % 5 != 0 && row % 16 < 12 && (x / 4 + row) % 3 == 0;
                if ink {
                    [0x20, 0x20, (line % 256) as u8, 0xff]
                } else {
                    let bg = if line % 2 == 0 { 0xf0 } else { 0xe0 };
                    [bg, bg, bg ^ (row % 7) as u8, 0xff]
                }
            }
            PatternMode::Band => {
                let (by, bh) = self.band_rows();
                let bw = (self.config.width / 4).max(1);
                let bx = offset % self.config.width.max(1);
                let in_band = y >= by && y < by + bh && (x + self.config.width - bx) % self.config.width < bw;
                if in_band {
                    let t = (offset / 4) as u8;
                    [t, (x as u8).wrapping_add(t), (y as u8).wrapping_sub(t), 0xff]
                } else {
                    let c = (((x / 32) + (y / 32)) % 2 * 0x40) as u8 + 0x60;
                    [c, c, c, 0xff]
                }
            }
        }
    }

    /// Draw `rect` at a given animation offset.
    pub fn render(&self, offset: u32, rect: Rectangle) -> Frame {
        let stride = rect.width * 4;
        let mut data = Vec::with_capacity((stride * rect.height) as usize);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                data.extend_from_slice(&self.pixel(offset, x, y));
            }
        }
        Frame::packed(rect.x, rect.y, rect.width, rect.height, PixelFormat::Bgrx, stride, data)
    }
}

impl FrameSource for TestPattern {
    fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn get_image(&mut self, rect: Rectangle) -> Option<Frame> {
        let rect = rect.clamp_to(self.config.width, self.config.height)?;
        Some(self.render(self.offset(), rect))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: PatternMode) -> CaptureConfig {
        CaptureConfig {
            width: 64,
            height: 48,
            fps: 25,
            mode,
            speed: 100,
        }
    }

    fn row(frame: &Frame, y: u32) -> &[u8] {
        let s = frame.rowstride() as usize;
        &frame.pixels()[y as usize * s..(y as usize + 1) * s]
    }

    #[test]
    fn scroll_mode_shifts_rows() {
        let p = TestPattern::new(config(PatternMode::Scroll));
        let full = Rectangle::new(0, 0, 64, 48);
        let a = p.render(0, full);
        let b = p.render(5, full);
        for y in 0..40 {
            assert_eq!(row(&b, y), row(&a, y + 5));
        }
    }

    #[test]
    fn band_damage_is_a_strip() {
        let p = TestPattern::new(config(PatternMode::Band));
        assert_eq!(p.damage_rect(), Rectangle::new(0, 16, 64, 16));
        let a = p.render(0, Rectangle::new(0, 0, 64, 48));
        let b = p.render(17, Rectangle::new(0, 0, 64, 48));
        // Outside the band nothing moves.
        assert_eq!(row(&a, 2), row(&b, 2));
        assert_eq!(row(&a, 40), row(&b, 40));
        assert_ne!(row(&a, 20), row(&b, 20));
    }

    #[test]
    fn get_image_clamps_to_window() {
        let mut p = TestPattern::new(config(PatternMode::Scroll)).frozen_at(3);
        let f = p.get_image(Rectangle::new(60, 40, 10, 10)).unwrap();
        assert_eq!((f.x, f.y, f.width, f.height), (60, 40, 4, 8));
        assert!(p.get_image(Rectangle::new(100, 100, 4, 4)).is_none());
    }

    #[test]
    fn interval_follows_fps() {
        assert_eq!(config(PatternMode::Scroll).interval(), Duration::from_millis(40));
    }
}
