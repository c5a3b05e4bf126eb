//! Video region detection.
//!
//! Looks at the recent damage history of a window and tries to find the
//! rectangle that behaves like video: damaged often, at a steady rate,
//! and mostly on its own. Damage inside the region goes to the video
//! encoder; everything else goes to picture encoders.
//!
//! ```text
//!   no region ──identify──▶ candidate ──events ≥ 20, fps ≥ 10──▶ video
//!       ▲                        │                                 │
//!       └──── reset / disabled / idle / no match ◀─────────────────┘
//! ```
//!
//! Lossy video frames leave the region blurry once the motion stops, so
//! damage landing in the region is tracked by [`add_video_refresh`] and
//! repainted at high quality when the refresh timer expires.
//!
//! [`add_video_refresh`]: VideoSubregion::add_video_refresh

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::policy::PipelinePolicy;
use crate::region::{Rectangle, add_rectangle, merge_all, remove_rectangle};
use crate::video::stats::DamageEvent;
use crate::video::timer::{TimerHandle, TimerQueue};

pub const MIN_W: u32 = 128;
pub const MIN_H: u32 = 96;
/// History window used for detection.
pub const MAX_TIME: Duration = Duration::from_secs(5);
pub const MIN_EVENTS: usize = 20;
pub const RATIO_WEIGHT: f64 = 80.0;
/// A current region scoring at least this is kept without looking further.
pub const KEEP_SCORE: i64 = 160;

/// Outside slivers below this many pixels are ignored when scoring bands.
const SLIVER: u64 = 48 * 48;
/// Minimum refresh delay.
const MIN_REFRESH: Duration = Duration::from_millis(150);

/// Score a region from the pixels damaged inside and outside of it.
pub fn scoreinout(ww: u32, wh: u32, region: &Rectangle, incount: u64, outcount: u64) -> i64 {
    let total = incount + outcount;
    if total == 0 || ww == 0 || wh == 0 {
        return 0;
    }
    let inregion = incount as f64 / total as f64;
    let width = ww.min(region.width) as f64;
    let height = wh.min(region.height) as f64;
    let inwindow = width * height / (ww as f64 * wh as f64);
    let ratio = inregion / inwindow;
    let mut score = 100.0 * inregion;
    score += (inregion - 0.35).max(0.0) * (ratio.min(6.0).sqrt() - 1.0) * RATIO_WEIGHT;
    score.max(0.0) as i64
}

#[derive(Debug)]
enum Refresh {
    /// Repaint the accumulated in-region refresh list.
    Region,
    /// Repaint rectangles that fell outside the region.
    Outside(Vec<Rectangle>),
}

/// Per-window video region state.
#[derive(Debug)]
pub struct VideoSubregion {
    policy: Arc<PipelinePolicy>,
    /// Detection is allowed for this window and client.
    pub supported: bool,
    pub enabled: bool,
    /// When off, the region is only set explicitly.
    pub detection: bool,
    exclusion_zones: Vec<(i32, i32, u32, u32)>,

    pub rectangle: Option<Rectangle>,
    /// Damaged pixels inside / outside the region.
    pub inout: (u64, u64),
    pub score: i64,
    pub fps: u32,
    /// Percentage of the region that got damaged.
    pub damaged: u32,
    /// Damage event count when the region was set.
    pub set_at: u64,
    /// Damage event count at the last full analysis.
    counter: u64,
    time: Option<Instant>,
    /// Events before this instant are ignored.
    min_time: Instant,
    pub non_max_wait: Duration,
    auto_refresh_delay: Duration,

    refresh_regions: Vec<Rectangle>,
    refresh_timer: Option<TimerHandle>,
    timers: TimerQueue<Refresh>,
    last_scores: Vec<(Rectangle, i64)>,
}

impl VideoSubregion {
    pub fn new(policy: Arc<PipelinePolicy>, now: Instant) -> Self {
        let v = &policy.video;
        let supported = v.subregion;
        let exclusion_zones = v.exclusion_zones.clone();
        let non_max_wait = Duration::from_millis(v.non_max_wait_ms);
        let auto_refresh_delay = Duration::from_millis(v.auto_refresh_delay_ms);
        Self {
            policy,
            supported,
            enabled: true,
            detection: true,
            exclusion_zones,
            rectangle: None,
            inout: (0, 0),
            score: 0,
            fps: 0,
            damaged: 0,
            set_at: 0,
            counter: 0,
            time: None,
            min_time: now,
            non_max_wait,
            auto_refresh_delay,
            refresh_regions: Vec::new(),
            refresh_timer: None,
            timers: TimerQueue::new(),
            last_scores: Vec::new(),
        }
    }

    /// Forget everything, including pending refreshes.
    pub fn reset(&mut self, now: Instant) {
        self.timers.clear();
        self.refresh_timer = None;
        self.refresh_regions.clear();
        self.last_scores.clear();
        self.novideoregion("reset");
        self.min_time = now;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.novideoregion("disabled");
        }
    }

    pub fn set_detection(&mut self, detection: bool, now: Instant) {
        self.detection = detection;
        if !detection {
            self.reset(now);
        }
    }

    /// Set the region explicitly; only honoured with detection off.
    pub fn set_region(&mut self, rect: Option<Rectangle>) {
        if self.detection {
            tracing::debug!("video region detection is on, ignoring explicit region");
            return;
        }
        match rect {
            Some(r) if !r.is_empty() => self.rectangle = Some(r),
            _ => self.novideoregion("cleared"),
        }
    }

    /// Zones as `(x, y, w, h)`; negative x / y are relative to the
    /// right / bottom edge.
    pub fn set_exclusion_zones(&mut self, zones: Vec<(i32, i32, u32, u32)>) {
        self.exclusion_zones = zones;
        self.counter = 0;
    }

    pub fn set_auto_refresh_delay(&mut self, delay: Duration) {
        self.auto_refresh_delay = delay;
    }

    /// Scores computed during the last analysis.
    pub fn last_scores(&self) -> &[(Rectangle, i64)] {
        &self.last_scores
    }

    /// Whether the current region is confirmed video.
    ///
    /// Thresholds are halved when the window content is known to be video.
    pub fn is_video(&self, damage_events_count: u64, content_is_video: bool) -> bool {
        if self.rectangle.is_none() {
            return false;
        }
        let mut min_events = self.policy.video.min_video_events;
        let mut min_fps = self.policy.video.min_video_fps;
        if content_is_video {
            min_events /= 2;
            min_fps /= 2;
        }
        damage_events_count.saturating_sub(self.set_at) >= min_events && self.fps >= min_fps
    }

    /// The region, if a `width x height` frame matches it modulo the masks.
    pub fn matches(&self, width: u32, height: u32, width_mask: u32, height_mask: u32) -> Option<Rectangle> {
        let vr = self.rectangle?;
        let mw = width.abs_diff(vr.width) & width_mask;
        let mh = height.abs_diff(vr.height) & height_mask;
        (mw == 0 && mh == 0).then_some(vr)
    }

    fn novideoregion(&mut self, reason: &str) {
        if self.rectangle.is_some() {
            tracing::debug!(reason, "clearing video region");
        }
        self.rectangle = None;
        self.time = None;
        self.set_at = 0;
        self.counter = 0;
        self.inout = (0, 0);
        self.score = 0;
        self.fps = 0;
        self.damaged = 0;
    }

    /// Resolve an exclusion zone against the window size.
    fn zone_rect(&self, zone: (i32, i32, u32, u32), ww: u32, wh: u32) -> Rectangle {
        let (x, y, w, h) = zone;
        let x = if x < 0 { ww.saturating_sub(w) } else { x as u32 };
        let y = if y < 0 { wh.saturating_sub(h) } else { y as u32 };
        Rectangle::new(x, y, w, h)
    }

    /// `rect` minus every exclusion zone.
    fn excluded_rectangles(&self, rect: Rectangle, ww: u32, wh: u32) -> Vec<Rectangle> {
        let mut rects = vec![rect];
        for &zone in &self.exclusion_zones {
            let z = self.zone_rect(zone, ww, wh);
            rects = rects.iter().flat_map(|r| r.subtract_rect(&z)).collect();
        }
        rects
    }

    // ── Detection ────────────────────────────────────────────────

    /// Re-evaluate the video region from the damage history.
    pub fn identify<'a, I>(&mut self, ww: u32, wh: u32, damage_events_count: u64, events: I, now: Instant)
    where
        I: IntoIterator<Item = &'a DamageEvent>,
    {
        if !self.enabled || !self.supported {
            self.novideoregion("disabled");
            return;
        }
        if !self.detection {
            return;
        }
        if damage_events_count < self.set_at {
            self.set_at = 0;
        }
        let rect = self.rectangle;
        if rect.is_some_and(|r| r.width > ww || r.height > wh) {
            self.novideoregion("window is now smaller than the region");
            return;
        }
        if ww < MIN_W || wh < MIN_H {
            self.novideoregion("window is too small");
            return;
        }
        if self.counter + 10 > damage_events_count {
            let elapsed = self.time.map(|t| now.saturating_duration_since(t)).unwrap_or_default();
            let event_count = damage_events_count.saturating_sub(self.set_at);
            let slow_region_timeout = 2.0 + (2.0 + event_count as f64).log(1.5);
            if rect.is_some() && elapsed.as_secs_f64() >= slow_region_timeout {
                self.counter = damage_events_count;
                self.time = Some(now);
                self.novideoregion("inactive");
            }
            return;
        }

        let from_time = [now.checked_sub(MAX_TIME), Some(self.min_time)]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(now);
        let lde: Vec<Rectangle> = events
            .into_iter()
            .filter(|e| e.when >= from_time)
            .map(|e| e.rect)
            .collect();
        if lde.len() <= MIN_EVENTS {
            self.novideoregion("not enough damage events");
            return;
        }

        let analysis = Analysis::new(self, &lde, ww, wh);
        self.counter = damage_events_count;
        self.time = Some(now);
        let elapsed = now.saturating_duration_since(from_time);
        let mut ctx = Decision {
            analysis,
            damage_events_count,
            elapsed,
        };
        let choice = self.choose(&mut ctx, rect);
        self.last_scores = ctx.analysis.scores.clone();
        match choice {
            Some(r) => self.setnewregion(&ctx, r),
            None => self.novideoregion("failed to identify a video region"),
        }
    }

    fn choose(&self, ctx: &mut Decision, current: Option<Rectangle>) -> Option<Rectangle> {
        let a = &mut ctx.analysis;
        if a.dec.len() == 1 {
            return a.dec.keys().next().copied();
        }
        let mut cur_score = 0;
        if let Some(r) = current {
            cur_score = a.score_region(&r, 0, None);
            if cur_score >= KEEP_SCORE {
                return Some(r);
            }
        }

        let min_count = (a.lde.len() / 40).max(2) as u32;
        let damage_count: Vec<(Rectangle, u32)> = a
            .dec
            .iter()
            .filter(|(r, c)| **c > min_count && r.width >= MIN_W && r.height >= MIN_H)
            .map(|(r, c)| (*r, *c))
            .collect();
        if let Some(most) = damage_count.iter().map(|(_, c)| *c).max() {
            let most_damaged: Vec<Rectangle> = damage_count.iter().filter(|(_, c)| *c == most).map(|(r, _)| *r).collect();
            if let [r] = most_damaged.as_slice() {
                let score = a.score_region(r, 0, Some(1.0));
                if score > 120 {
                    return Some(*r);
                }
            }
        }

        for bands in [a.wc.clone(), a.hc.clone()] {
            for by_pos in bands.values() {
                for regions in by_pos.values() {
                    if regions.len() < 2 {
                        continue;
                    }
                    let min_count = (regions.len() / 25).max(2) as u32;
                    let keep: Vec<Rectangle> = regions
                        .iter()
                        .filter(|r| a.dec.get(*r).copied().unwrap_or(0) >= min_count)
                        .copied()
                        .collect();
                    if let Some(merged) = merge_all(&keep) {
                        a.score_region(&merged, SLIVER, None);
                    }
                }
            }
        }

        let (best, highscore) = a
            .scores
            .iter()
            .fold((None, 0), |(br, bs), (r, s)| if *s > bs { (Some(*r), *s) } else { (br, bs) });
        if highscore >= 120 {
            return best;
        }
        if cur_score >= 90 && (highscore < 100 || cur_score >= highscore) {
            return current;
        }
        if highscore >= 100 {
            return best;
        }
        if damage_count.len() >= 2 {
            let rects: Vec<Rectangle> = damage_count.iter().map(|(r, _)| *r).collect();
            if let Some(merged) = merge_all(&rects) {
                if a.score_region(&merged, 0, None) >= 110 {
                    return Some(merged);
                }
            }
        }
        None
    }

    fn setnewregion(&mut self, ctx: &Decision, rect: Rectangle) {
        let (ww, wh) = (ctx.analysis.ww, ctx.analysis.wh);
        let mut rects = self.excluded_rectangles(rect, ww, wh);
        let rect = match rects.len() {
            0 => {
                self.novideoregion("no match after removing excluded zones");
                return;
            }
            1 => rects[0],
            _ => {
                rects.sort_by_key(|r| std::cmp::Reverse(r.area()));
                let r = rects[0];
                if r.width < MIN_W || r.height < MIN_H {
                    self.novideoregion("match too small after removing excluded zones");
                    return;
                }
                r
            }
        };
        if self.rectangle != Some(rect) {
            self.set_at = ctx.damage_events_count;
            self.counter = ctx.damage_events_count;
            tracing::debug!(region = %rect, "new video region");
        }
        self.rectangle = Some(rect);
        self.inout = ctx.analysis.inoutcount(&rect, 0);
        self.score = scoreinout(ww, wh, &rect, self.inout.0, self.inout.1);
        let secs = ctx.elapsed.as_secs_f64();
        self.fps = if secs <= 0.0 || rect.area() == 0 {
            0
        } else {
            (self.inout.0 as f64 / rect.area() as f64 / secs) as u32
        };
        self.damaged = (100.0 * ctx.analysis.damaged_ratio(&rect)) as u32;
    }

    // ── Refresh ──────────────────────────────────────────────────

    /// Track lossy damage for a later high quality repaint.
    pub fn add_video_refresh(&mut self, region: Rectangle, now: Instant) {
        let Some(rect) = self.rectangle else {
            return;
        };
        if let Some(h) = self.refresh_timer.take() {
            self.timers.cancel(h);
        }
        add_rectangle(&mut self.refresh_regions, region);
        let non_video: Vec<Rectangle> = self
            .refresh_regions
            .iter()
            .filter(|r| !rect.contains_rect(r))
            .flat_map(|r| r.subtract_rect(&rect))
            .collect();
        let delay = MIN_REFRESH.max(self.auto_refresh_delay);
        if !non_video.is_empty() {
            self.timers.schedule(now + delay, Refresh::Outside(non_video));
            self.refresh_regions = self.refresh_regions.iter().filter_map(|r| rect.intersection(r)).collect();
        }
        if !self.refresh_regions.is_empty() {
            self.refresh_timer = Some(self.timers.schedule(now + delay, Refresh::Region));
        }
    }

    /// Region was repainted some other way.
    pub fn remove_refresh_region(&mut self, region: &Rectangle) {
        remove_rectangle(&mut self.refresh_regions, region);
    }

    pub fn cancel_refresh_timer(&mut self) {
        if let Some(h) = self.refresh_timer.take() {
            self.timers.cancel(h);
        }
    }

    pub fn next_refresh_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Region lists due for a high quality repaint.
    pub fn poll_refresh(&mut self, now: Instant) -> Vec<Vec<Rectangle>> {
        let mut out = Vec::new();
        while let Some((handle, what)) = self.timers.pop_due(now) {
            let regions = match what {
                Refresh::Outside(rects) => rects,
                Refresh::Region => {
                    if self.refresh_timer == Some(handle) {
                        self.refresh_timer = None;
                    }
                    let regions = std::mem::take(&mut self.refresh_regions);
                    match self.rectangle {
                        Some(rect) if regions.len() >= 2 => vec![rect],
                        _ => regions,
                    }
                }
            };
            if !regions.is_empty() {
                tracing::trace!(count = regions.len(), "video region refresh due");
                out.push(regions);
            }
        }
        out
    }
}

// ── Analysis ─────────────────────────────────────────────────────

/// Damage histogram for one detection pass.
struct Analysis {
    ww: u32,
    wh: u32,
    lde: Vec<Rectangle>,
    /// Damage count per rectangle (exclusion zones removed).
    dec: BTreeMap<Rectangle, u32>,
    /// width → x → rectangles.
    wc: BTreeMap<u32, BTreeMap<u32, BTreeSet<Rectangle>>>,
    /// height → y → rectangles.
    hc: BTreeMap<u32, BTreeMap<u32, BTreeSet<Rectangle>>>,
    all_damaged: bool,
    /// Scores in insertion order.
    scores: Vec<(Rectangle, i64)>,
}

struct Decision {
    analysis: Analysis,
    damage_events_count: u64,
    elapsed: Duration,
}

impl Analysis {
    fn new(sr: &VideoSubregion, lde: &[Rectangle], ww: u32, wh: u32) -> Self {
        let mut dec: BTreeMap<Rectangle, u32> = BTreeMap::new();
        let mut wc: BTreeMap<u32, BTreeMap<u32, BTreeSet<Rectangle>>> = BTreeMap::new();
        let mut hc: BTreeMap<u32, BTreeMap<u32, BTreeSet<Rectangle>>> = BTreeMap::new();
        for ev in lde {
            for r in sr.excluded_rectangles(*ev, ww, wh) {
                *dec.entry(r).or_default() += 1;
                if ev.width >= MIN_W {
                    wc.entry(ev.width).or_default().entry(ev.x).or_default().insert(r);
                }
                if ev.height >= MIN_H {
                    hc.entry(ev.height).or_default().entry(ev.y).or_default().insert(r);
                }
            }
        }
        let all_damaged = dec.contains_key(&Rectangle::new(0, 0, ww, wh));
        Self {
            ww,
            wh,
            lde: lde.to_vec(),
            dec,
            wc,
            hc,
            all_damaged,
            scores: Vec::new(),
        }
    }

    fn inoutcount(&self, region: &Rectangle, ignore_size: u64) -> (u64, u64) {
        let (mut incount, mut outcount) = (0u64, 0u64);
        for (r, count) in &self.dec {
            let count = *count as u64;
            if let Some(inr) = r.intersection(region) {
                incount += inr.area() * count;
            }
            for out in r.subtract_rect(region) {
                if ignore_size > 0 && out.area() < ignore_size {
                    continue;
                }
                outcount += out.area() * count;
            }
        }
        (incount, outcount)
    }

    /// Fraction of `rect` covered by at least one damage event.
    fn damaged_ratio(&self, rect: &Rectangle) -> f64 {
        if self.all_damaged {
            return 1.0;
        }
        let mut rects = vec![*rect];
        for ev in &self.lde {
            rects = rects.iter().flat_map(|r| r.subtract_rect(ev)).collect();
            if rects.is_empty() {
                return 1.0;
            }
        }
        let not_damaged: u64 = rects.iter().map(|r| r.area()).sum();
        if rect.area() == 0 {
            return 0.0;
        }
        (1.0 - not_damaged as f64 / rect.area() as f64).clamp(0.0, 1.0)
    }

    fn score_region(&mut self, region: &Rectangle, ignore_size: u64, d_ratio: Option<f64>) -> i64 {
        if let Some((_, s)) = self.scores.iter().find(|(r, _)| r == region) {
            return *s;
        }
        if region.width < MIN_W || region.height < MIN_H {
            return 0;
        }
        if (self.ww as u64 * self.wh as u64) < region.area() {
            return 0;
        }
        let (incount, outcount) = self.inoutcount(region, ignore_size);
        let d_ratio = d_ratio.unwrap_or_else(|| self.damaged_ratio(region));
        let score = (scoreinout(self.ww, self.wh, region, incount, outcount) as f64 * d_ratio.sqrt()) as i64;
        tracing::trace!(region = %region, score, "scored candidate region");
        self.scores.push((*region, score));
        score
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn subregion(now: Instant) -> VideoSubregion {
        VideoSubregion::new(Arc::new(PipelinePolicy::default()), now)
    }

    fn events(t0: Instant, rects: &[Rectangle], count: usize) -> Vec<DamageEvent> {
        (0..count)
            .map(|i| DamageEvent {
                when: t0 + Duration::from_millis(40 * i as u64),
                rect: rects[i % rects.len()],
            })
            .collect()
    }

    #[test]
    fn scoreinout_prefers_concentrated_damage() {
        let r = Rectangle::new(0, 0, 320, 240);
        let all_in = scoreinout(1280, 960, &r, 1000, 0);
        let half = scoreinout(1280, 960, &r, 500, 500);
        assert!(all_in > 150, "score = {all_in}");
        assert!(half < all_in);
        assert_eq!(scoreinout(1280, 960, &r, 0, 0), 0);
    }

    #[test]
    fn single_damaged_rect_becomes_region() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        let video = Rectangle::new(100, 100, 320, 240);
        let evs = events(t0, &[video], 50);
        let now = t0 + Duration::from_secs(2);
        sr.identify(1280, 960, 50, &evs, now);
        assert_eq!(sr.rectangle, Some(video));
        assert_eq!(sr.set_at, 50);
        assert!(sr.fps >= 20, "fps = {}", sr.fps);
        assert!(!sr.is_video(50, false));
        assert!(sr.is_video(70, false));
    }

    #[test]
    fn mostly_damaged_rect_wins_over_noise() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        let video = Rectangle::new(200, 150, 640, 360);
        let mut rects = vec![video; 9];
        rects.push(Rectangle::new(0, 0, 20, 20));
        let evs = events(t0, &rects, 100);
        sr.identify(1280, 960, 100, &evs, t0 + Duration::from_secs(4));
        assert_eq!(sr.rectangle, Some(video));
    }

    #[test]
    fn too_few_events_or_small_window() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        let evs = events(t0, &[Rectangle::new(0, 0, 200, 200)], 15);
        sr.identify(1280, 960, 15, &evs, t0 + Duration::from_secs(1));
        assert!(sr.rectangle.is_none());
        let evs = events(t0, &[Rectangle::new(0, 0, 100, 50)], 50);
        sr.identify(100, 50, 50, &evs, t0 + Duration::from_secs(2));
        assert!(sr.rectangle.is_none());
    }

    #[test]
    fn inactivity_clears_region() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        let video = Rectangle::new(0, 0, 320, 240);
        let evs = events(t0, &[video], 40);
        sr.identify(1280, 960, 40, &evs, t0 + Duration::from_secs(2));
        assert!(sr.rectangle.is_some());
        // two new events: times out after 2 + log1.5(4) ≈ 5.4s
        sr.identify(1280, 960, 42, &evs, t0 + Duration::from_secs(6));
        assert!(sr.rectangle.is_some());
        sr.identify(1280, 960, 42, &evs, t0 + Duration::from_secs(8));
        assert!(sr.rectangle.is_none());
    }

    #[test]
    fn exclusion_zone_trims_region() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        sr.set_exclusion_zones(vec![(-1, 0, 100, 960)]);
        let evs = events(t0, &[Rectangle::new(0, 0, 1280, 480)], 40);
        sr.identify(1280, 960, 40, &evs, t0 + Duration::from_secs(2));
        assert_eq!(sr.rectangle, Some(Rectangle::new(0, 0, 1180, 480)));
    }

    #[test]
    fn disabled_and_reset() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        let evs = events(t0, &[Rectangle::new(0, 0, 320, 240)], 40);
        sr.identify(1280, 960, 40, &evs, t0 + Duration::from_secs(2));
        assert!(sr.rectangle.is_some());
        sr.set_enabled(false);
        assert!(sr.rectangle.is_none());
        sr.identify(1280, 960, 60, &evs, t0 + Duration::from_secs(2));
        assert!(sr.rectangle.is_none());

        sr.set_enabled(true);
        let later = t0 + Duration::from_secs(3);
        sr.reset(later);
        // events before the reset are ignored
        sr.identify(1280, 960, 80, &evs, later);
        assert!(sr.rectangle.is_none());
    }

    #[test]
    fn refresh_collapses_to_region() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        let video = Rectangle::new(0, 0, 320, 240);
        let evs = events(t0, &[video], 40);
        sr.identify(1280, 960, 40, &evs, t0 + Duration::from_secs(2));

        sr.add_video_refresh(Rectangle::new(0, 0, 10, 10), t0);
        sr.add_video_refresh(Rectangle::new(100, 100, 10, 10), t0);
        sr.add_video_refresh(Rectangle::new(300, 0, 40, 10), t0);
        assert_eq!(sr.next_refresh_deadline(), Some(t0 + Duration::from_millis(150)));
        assert!(sr.poll_refresh(t0 + Duration::from_millis(100)).is_empty());

        let due = sr.poll_refresh(t0 + Duration::from_millis(200));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0], vec![Rectangle::new(320, 0, 20, 10)]);
        assert_eq!(due[1], vec![video]);
        assert!(sr.poll_refresh(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn refresh_needs_a_region() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        sr.add_video_refresh(Rectangle::new(0, 0, 10, 10), t0);
        assert!(sr.next_refresh_deadline().is_none());
    }

    #[test]
    fn matches_with_masks() {
        let t0 = Instant::now();
        let mut sr = subregion(t0);
        sr.detection = false;
        sr.set_region(Some(Rectangle::new(0, 0, 320, 240)));
        assert!(sr.matches(321, 241, !1, !1).is_some());
        assert!(sr.matches(324, 240, !1, !1).is_none());
    }
}
