//! Window-relative rectangles.

use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge (exclusive).
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn intersects(&self, other: &Rectangle) -> bool {
        self.intersection(other).is_some()
    }

    /// Overlapping area, if any.
    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let r = self.right().min(other.right());
        let b = self.bottom().min(other.bottom());
        if r <= x || b <= y {
            return None;
        }
        Some(Rectangle::new(x, y, r - x, b - y))
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains_rect(&self, other: &Rectangle) -> bool {
        other.x >= self.x && other.y >= self.y && other.right() <= self.right() && other.bottom() <= self.bottom()
    }

    /// The parts of `self` not covered by `other` (at most four pieces).
    ///
    /// Pieces are split top band, bottom band, then left and right of the
    /// overlap.
    pub fn subtract_rect(&self, other: &Rectangle) -> Vec<Rectangle> {
        let Some(overlap) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };
        let mut out = Vec::with_capacity(4);
        if overlap.y > self.y {
            out.push(Rectangle::new(self.x, self.y, self.width, overlap.y - self.y));
        }
        if overlap.bottom() < self.bottom() {
            out.push(Rectangle::new(
                self.x,
                overlap.bottom(),
                self.width,
                self.bottom() - overlap.bottom(),
            ));
        }
        if overlap.x > self.x {
            out.push(Rectangle::new(self.x, overlap.y, overlap.x - self.x, overlap.height));
        }
        if overlap.right() < self.right() {
            out.push(Rectangle::new(
                overlap.right(),
                overlap.y,
                self.right() - overlap.right(),
                overlap.height,
            ));
        }
        out
    }

    /// Clamp to a `width` x `height` window.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rectangle> {
        self.intersection(&Rectangle::new(0, 0, width, height))
    }
}

impl std::fmt::Display for Rectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{},{}", self.width, self.height, self.x, self.y)
    }
}

/// Bounding box of all rectangles.
pub fn merge_all(rects: &[Rectangle]) -> Option<Rectangle> {
    let first = rects.first()?;
    let (mut x, mut y, mut r, mut b) = (first.x, first.y, first.right(), first.bottom());
    for rect in &rects[1..] {
        x = x.min(rect.x);
        y = y.min(rect.y);
        r = r.max(rect.right());
        b = b.max(rect.bottom());
    }
    Some(Rectangle::new(x, y, r - x, b - y))
}

/// Add `rect` to `list` unless an existing entry already contains it,
/// dropping entries that `rect` contains.
pub fn add_rectangle(list: &mut Vec<Rectangle>, rect: Rectangle) {
    if list.iter().any(|r| r.contains_rect(&rect)) {
        return;
    }
    list.retain(|r| !rect.contains_rect(r));
    list.push(rect);
}

/// Remove `rect` from every entry of `list`.
pub fn remove_rectangle(list: &mut Vec<Rectangle>, rect: &Rectangle) {
    let mut out = Vec::with_capacity(list.len());
    for r in list.drain(..) {
        out.extend(r.subtract_rect(rect));
    }
    *list = out;
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_and_contains() {
        let a = Rectangle::new(0, 0, 100, 100);
        let b = Rectangle::new(50, 60, 100, 100);
        assert_eq!(a.intersection(&b), Some(Rectangle::new(50, 60, 50, 40)));
        assert!(a.contains_rect(&Rectangle::new(10, 10, 90, 90)));
        assert!(!a.contains_rect(&b));
        assert_eq!(a.intersection(&Rectangle::new(100, 0, 5, 5)), None);
    }

    #[test]
    fn subtract_covers_remainder() {
        let a = Rectangle::new(0, 0, 100, 100);
        let hole = Rectangle::new(25, 25, 50, 50);
        let pieces = a.subtract_rect(&hole);
        assert_eq!(pieces.len(), 4);
        let area: u64 = pieces.iter().map(|r| r.area()).sum();
        assert_eq!(area, a.area() - hole.area());
        assert!(pieces.iter().all(|p| !p.intersects(&hole)));
    }

    #[test]
    fn subtract_disjoint_and_full() {
        let a = Rectangle::new(0, 0, 10, 10);
        assert_eq!(a.subtract_rect(&Rectangle::new(20, 20, 5, 5)), vec![a]);
        assert!(a.subtract_rect(&Rectangle::new(0, 0, 20, 20)).is_empty());
    }

    #[test]
    fn merge_all_bounding_box() {
        let rects = [Rectangle::new(10, 10, 5, 5), Rectangle::new(0, 20, 5, 5)];
        assert_eq!(merge_all(&rects), Some(Rectangle::new(0, 10, 15, 15)));
        assert_eq!(merge_all(&[]), None);
    }

    #[test]
    fn add_and_remove_rectangles() {
        let mut list = vec![Rectangle::new(0, 0, 10, 10)];
        add_rectangle(&mut list, Rectangle::new(2, 2, 2, 2));
        assert_eq!(list.len(), 1);
        add_rectangle(&mut list, Rectangle::new(0, 0, 20, 20));
        assert_eq!(list, vec![Rectangle::new(0, 0, 20, 20)]);
        remove_rectangle(&mut list, &Rectangle::new(0, 0, 20, 10));
        assert_eq!(list, vec![Rectangle::new(0, 10, 20, 10)]);
    }
}
