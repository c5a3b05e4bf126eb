//! Scroll detection.
//!
//! Hashes every row of consecutive frames and looks for vertical offsets
//! that map old rows onto new ones. Rows that moved become scroll zones
//! the client can copy locally; the rest is repainted.
//!
//! ```text
//!   old           new
//!   row 100 ─┐    row 100  ← repainted (non-scroll)
//!   row 101 ─┼──▶ row 120  ← zone: old_y=100, offset=+20
//!     ...    │      ...
//!   row 479 ─┘    row 499
//! ```

use std::collections::{BTreeMap, HashMap};

use crate::policy::ScrollPolicy;

/// Hashes seen more often than this in the old frame are ignored when
/// building the offset histogram.
const MAX_REPEAT: usize = 4;
/// Upper bound for the search distance.
const MAX_DISTANCE: u32 = 1000;

/// Hash one row; `blake3` truncated to 64 bits.
fn row_hash(row: &[u8]) -> u64 {
    let h = blake3::hash(row);
    let mut b = [0u8; 8];
    b.copy_from_slice(&h.as_bytes()[..8]);
    u64::from_le_bytes(b)
}

/// Result of one detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrollMatch {
    /// Percentage of rows assigned to any offset.
    pub match_percent: u32,
    /// `offset → [(old_y, count)]`, offset 0 included.
    pub zones: BTreeMap<i32, Vec<(u32, u32)>>,
    /// `[(new_y, count)]` rows that must be repainted.
    pub non_scroll: Vec<(u32, u32)>,
}

impl ScrollMatch {
    /// Whether any zone actually moves.
    pub fn has_scroll(&self) -> bool {
        self.zones.iter().any(|(off, z)| *off != 0 && !z.is_empty())
    }

    /// Scroll zones with a non-zero offset.
    pub fn moving_zones(&self) -> impl Iterator<Item = (i32, u32, u32)> + '_ {
        self.zones
            .iter()
            .filter(|(off, _)| **off != 0)
            .flat_map(|(off, z)| z.iter().map(move |(y, n)| (*off, *y, *n)))
    }

    fn collapse(&mut self, height: u32) {
        self.zones.clear();
        self.non_scroll = vec![(0, height)];
        self.match_percent = 0;
    }
}

/// Row hashes of the previous and current frame.
#[derive(Debug, Clone, Default)]
pub struct ScrollData {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Previous frame; `None` entries were invalidated.
    a1: Option<Vec<Option<u64>>>,
    /// Current frame.
    a2: Vec<Option<u64>>,
    /// `offset → row count` from the last `calculate`.
    distances: BTreeMap<i32, u32>,
}

impl ScrollData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a new frame, keeping the previous one when the geometry matches.
    #[allow(clippy::too_many_arguments)]
    pub fn update(&mut self, pixels: &[u8], x: u32, y: u32, w: u32, h: u32, stride: u32, bpp: u32) {
        if (x, y, w, h) != (self.x, self.y, self.width, self.height) {
            self.a1 = None;
            self.a2.clear();
        } else {
            self.a1 = Some(std::mem::take(&mut self.a2));
        }
        self.x = x;
        self.y = y;
        self.width = w;
        self.height = h;
        self.distances.clear();
        let row_len = (w * bpp) as usize;
        self.a2 = (0..h as usize)
            .map(|row| {
                let start = row * stride as usize;
                pixels.get(start..start + row_len).map(row_hash)
            })
            .collect();
    }

    /// Build the offset histogram for matches within `max_distance` rows.
    pub fn calculate(&mut self, max_distance: u32) {
        self.distances.clear();
        let Some(a1) = &self.a1 else {
            return;
        };
        let mut old_rows: HashMap<u64, Vec<usize>> = HashMap::new();
        for (row, hash) in a1.iter().enumerate() {
            if let Some(h) = hash {
                old_rows.entry(*h).or_default().push(row);
            }
        }
        for (new_row, hash) in self.a2.iter().enumerate() {
            let Some(rows) = hash.and_then(|h| old_rows.get(&h)) else {
                continue;
            };
            if rows.len() > MAX_REPEAT {
                continue;
            }
            for &old_row in rows {
                let offset = new_row as i64 - old_row as i64;
                if offset.unsigned_abs() <= max_distance as u64 {
                    *self.distances.entry(offset as i32).or_default() += 1;
                }
            }
        }
    }

    /// Most common offset and its row count.
    pub fn get_best_match(&self) -> Option<(i32, u32)> {
        self.distances
            .iter()
            .fold(None, |best: Option<(i32, u32)>, (off, n)| match best {
                Some((_, bn)) if bn >= *n => best,
                _ => Some((*off, *n)),
            })
    }

    /// Assign rows to offsets and group them into zones.
    pub fn plan(&self) -> ScrollMatch {
        let h = self.a2.len();
        let mut out = ScrollMatch::default();
        if h == 0 {
            return out;
        }
        let Some(a1) = &self.a1 else {
            out.non_scroll = vec![(0, h as u32)];
            return out;
        };
        let mut assigned: Vec<Option<i32>> = vec![None; h];
        let same = |new_row: usize, old_row: i64| -> bool {
            if old_row < 0 || old_row as usize >= a1.len() {
                return false;
            }
            matches!((self.a2[new_row], a1[old_row as usize]), (Some(a), Some(b)) if a == b)
        };
        for (row, slot) in assigned.iter_mut().enumerate() {
            if same(row, row as i64) {
                *slot = Some(0);
            }
        }
        let mut offsets: Vec<(i32, u32)> = self.distances.iter().filter(|(o, _)| **o != 0).map(|(o, n)| (*o, *n)).collect();
        offsets.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.abs().cmp(&b.0.abs())));
        for (offset, _) in offsets {
            for (row, slot) in assigned.iter_mut().enumerate() {
                if slot.is_none() && same(row, row as i64 - offset as i64) {
                    *slot = Some(offset);
                }
            }
        }

        let mut matched = 0u32;
        let mut row = 0usize;
        while row < h {
            let current = assigned[row];
            let start = row;
            while row < h && assigned[row] == current {
                row += 1;
            }
            let count = (row - start) as u32;
            match current {
                Some(offset) => {
                    matched += count;
                    let old_y = (start as i64 - offset as i64) as u32;
                    out.zones.entry(offset).or_default().push((old_y, count));
                }
                None => out.non_scroll.push((start as u32, count)),
            }
        }
        out.match_percent = matched * 100 / h as u32;
        out
    }

    /// Update, calculate and plan in one pass.
    #[allow(clippy::too_many_arguments)]
    pub fn detect(
        &mut self,
        pixels: &[u8],
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        stride: u32,
        bpp: u32,
        policy: &ScrollPolicy,
    ) -> ScrollMatch {
        self.update(pixels, x, y, w, h, stride, bpp);
        let min_percent = policy.min_percent.min(100) as u32;
        let max_distance = MAX_DISTANCE.min((100 - min_percent) * h / 100);
        self.calculate(max_distance);
        let mut m = self.plan();
        let pieces = m.moving_zones().count() + m.non_scroll.len();
        if pieces > policy.zone_cap() {
            tracing::debug!(pieces, cap = policy.zone_cap(), "too many scroll pieces, sending one region");
            m.collapse(h);
        }
        tracing::trace!(
            match_percent = m.match_percent,
            best = ?self.get_best_match(),
            non_scroll = m.non_scroll.len(),
            "scroll detection"
        );
        m
    }

    /// Mark rows of the current frame as unusable scroll sources.
    pub fn invalidate(&mut self, y: u32, h: u32) {
        let end = (y as usize + h as usize).min(self.a2.len());
        for slot in self.a2.iter_mut().take(end).skip(y as usize) {
            *slot = None;
        }
    }

    /// Drop all state.
    pub fn free(&mut self) {
        *self = Self::default();
    }

    pub fn has_history(&self) -> bool {
        self.a1.is_some()
    }
}

// ── Tests ────────────────────────────────────────────────────────
