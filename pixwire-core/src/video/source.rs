//! Capture side of the encode pipeline.
//!
//! A [`WindowSource`] lives in the capture context. It turns damage
//! notifications into [`EncodeQueueItem`]s for the encode worker:
//!
//! ```text
//!   damage ─▶ delayed region ─(expire)─▶ send_delayed_regions
//!                                             │
//!                       ┌─────────────────────┼──────────────────────┐
//!                  video region            no region              novideo
//!                  (q ×70%, av-sync)       best encoding          picture
//!                       │                     │                      │
//!                       └──── process_damage_region ─────────────────┘
//!                                     │
//!                        av-sync queue (optional) ─▶ EncodeQueueItem
//! ```
//!
//! Nothing here blocks: every wait is a timer, fired by [`WindowSource::poll`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::caps::ClientCapabilities;
use crate::codecs::CodecRegistry;
use crate::image::{Frame, FrameSource};
use crate::policy::PipelinePolicy;
use crate::region::{Rectangle, add_rectangle, merge_all};
use crate::video::batch::{self, BatchConfig};
use crate::video::cancel::SequenceGate;
use crate::video::stats::WindowStats;
use crate::video::subregion::{MIN_H, MIN_W, VideoSubregion};
use crate::video::timer::{TimerHandle, TimerQueue};

/// Extra batching right after a resize.
const RESIZE_DELAY_MS: u64 = 25;
const RESIZE_WINDOW: Duration = Duration::from_millis(250);
/// Video region events before the non-video remainder may be held back.
const NON_VIDEO_HOLD_EVENTS: u64 = 100;
/// Holds shorter than this send the remainder at once.
const MIN_HOLD_MS: u64 = 25;

// ── Options ──────────────────────────────────────────────────────

/// Per-damage options supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DamageOptions {
    pub quality: Option<u8>,
    pub speed: Option<u8>,
    /// Force this encoding.
    pub encoding: Option<String>,
    /// Never use the video encoder.
    pub novideo: bool,
    /// Replace (rather than merge into) the options of a delayed region.
    pub override_options: bool,
    /// Damage we generated ourselves; not counted in the statistics.
    pub auto_refresh: bool,
}

impl DamageOptions {
    fn merge(&mut self, other: &DamageOptions) {
        if other.override_options {
            *self = DamageOptions {
                override_options: false,
                ..other.clone()
            };
            return;
        }
        self.quality = self.quality.or(other.quality);
        self.speed = self.speed.or(other.speed);
        if self.encoding.is_none() {
            self.encoding.clone_from(&other.encoding);
        }
        self.novideo |= other.novideo;
    }
}

/// Snapshot of the window state taken when a region is captured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeOptions {
    pub quality: u8,
    pub speed: u8,
    pub min_quality: u8,
    pub min_speed: u8,
    /// Batch delay in milliseconds.
    pub batch_delay: u64,
    /// Window content is video.
    pub content_video: bool,
    /// Window content is text.
    pub content_text: bool,
    pub fullscreen: bool,
    pub maximized: bool,
    pub video_region: Option<Rectangle>,
    pub video_fps: u32,
    /// The video region is confirmed.
    pub is_video: bool,
    /// Region detection is still in progress.
    pub detecting: bool,
    /// Scroll encoding is permitted.
    pub scroll: bool,
    pub bandwidth_limit: u64,
    pub window_size: (u32, u32),
    pub damage_events: u64,
    pub last_resized: Option<Instant>,
    pub last_scroll: Option<Instant>,
    pub novideo: bool,
    /// Lossless repaint of earlier lossy output.
    pub refresh: bool,
    pub av_sync: bool,
}

/// One captured region on its way to the encode worker.
#[derive(Debug, Clone)]
pub struct EncodeQueueItem {
    pub wid: u32,
    pub width: u32,
    pub height: u32,
    pub damage_time: Instant,
    pub enqueue_time: Instant,
    pub frame: Frame,
    pub encoding: String,
    pub sequence: u64,
    pub options: EncodeOptions,
    /// Packets still to follow for the same damage.
    pub flush: u32,
    pub gate: Arc<SequenceGate>,
    /// When the AV-sync queue releases the item.
    pub av_due: Option<Instant>,
}

impl EncodeQueueItem {
    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled(self.sequence)
    }
}

#[derive(Debug, Clone)]
struct DelayedRegion {
    damage_time: Instant,
    regions: Vec<Rectangle>,
    encoding: String,
    options: DamageOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceTimer {
    Expire,
    EncodeQueue,
}

// ── WindowSource ─────────────────────────────────────────────────

/// Capture-side state for one window.
pub struct WindowSource {
    pub wid: u32,
    policy: Arc<PipelinePolicy>,
    registry: CodecRegistry,
    source: Box<dyn FrameSource>,
    /// Preferred encoding.
    encoding: String,
    window_dimensions: (u32, u32),

    sequence: u64,
    gate: Arc<SequenceGate>,
    stats: WindowStats,
    batch: BatchConfig,
    subregion: VideoSubregion,

    delayed: Option<DelayedRegion>,
    expire_timer: Option<TimerHandle>,
    encode_queue: VecDeque<EncodeQueueItem>,
    encode_queue_due: Option<(Instant, TimerHandle)>,
    timers: TimerQueue<SourceTimer>,

    quality: u8,
    speed: u8,
    content_video: bool,
    content_text: bool,
    fullscreen: bool,
    maximized: bool,
    scroll: bool,
    bandwidth_limit: u64,
    /// Output queue occupancy last reported by the session.
    backlog: usize,
}

impl WindowSource {
    pub fn new(
        wid: u32,
        source: Box<dyn FrameSource>,
        policy: Arc<PipelinePolicy>,
        registry: CodecRegistry,
        caps: &ClientCapabilities,
        batch: &BatchConfig,
        now: Instant,
    ) -> Self {
        let encoding = registry
            .video_encodings()
            .into_iter()
            .next()
            .or_else(|| registry.picture_encodings().into_iter().next())
            .unwrap_or_else(|| crate::codecs::rgb::ENCODING.to_string());
        let window_dimensions = source.dimensions();
        let mut subregion = VideoSubregion::new(Arc::clone(&policy), now);
        subregion.set_enabled(registry.is_video_encoding(&encoding));
        Self {
            wid,
            quality: policy.video.initial_quality,
            speed: policy.video.initial_speed,
            scroll: caps.scrolling && policy.scroll.enabled,
            bandwidth_limit: caps.bandwidth_limit,
            policy,
            registry,
            source,
            encoding,
            window_dimensions,
            sequence: 0,
            gate: Arc::new(SequenceGate::new()),
            stats: WindowStats::new(),
            batch: batch.clone_settings(),
            subregion,
            delayed: None,
            expire_timer: None,
            encode_queue: VecDeque::new(),
            encode_queue_due: None,
            timers: TimerQueue::new(),
            content_video: false,
            content_text: false,
            fullscreen: false,
            maximized: false,
            backlog: 0,
        }
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn gate(&self) -> &Arc<SequenceGate> {
        &self.gate
    }

    pub fn stats(&self) -> &WindowStats {
        &self.stats
    }

    pub fn batch(&self) -> &BatchConfig {
        &self.batch
    }

    pub fn subregion(&self) -> &VideoSubregion {
        &self.subregion
    }

    pub fn subregion_mut(&mut self) -> &mut VideoSubregion {
        &mut self.subregion
    }

    pub fn has_delayed(&self) -> bool {
        self.delayed.is_some()
    }

    pub fn av_queue_len(&self) -> usize {
        self.encode_queue.len()
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.clamp(self.policy.video.min_quality, 100);
    }

    pub fn set_speed(&mut self, speed: u8) {
        self.speed = speed.clamp(self.policy.video.min_speed, 100);
    }

    /// Content hints from the window manager.
    pub fn set_content_type(&mut self, video: bool, text: bool) {
        self.content_video = video;
        self.content_text = text;
    }

    pub fn set_window_state(&mut self, fullscreen: bool, maximized: bool) {
        self.fullscreen = fullscreen;
        self.maximized = maximized;
    }

    /// The window scrolled; scaling holds off for a while.
    pub fn record_scroll(&mut self, now: Instant) {
        self.stats.record_scroll(now);
    }

    /// Earliest pending timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        match (self.timers.next_deadline(), self.subregion.next_refresh_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ── Damage ───────────────────────────────────────────────────

    /// Record damage and decide when to process it.
    pub fn damage(&mut self, rect: Rectangle, options: DamageOptions, now: Instant) {
        if rect.is_empty() {
            tracing::trace!(wid = self.wid, "ignoring empty damage");
            return;
        }
        let (ww, wh) = self.source.dimensions();
        if ww == 0 || wh == 0 {
            tracing::trace!(wid = self.wid, "ignoring damage for unmapped window");
            return;
        }
        self.sequence += 1;
        if !options.auto_refresh {
            self.stats.record_damage(now, rect);
        }
        if self.window_dimensions != (ww, wh) {
            tracing::debug!(wid = self.wid, width = ww, height = wh, "window dimensions changed");
            self.window_dimensions = (ww, wh);
            self.stats.record_resize(now);
        }

        if let Some(delayed) = &mut self.delayed {
            add_rectangle(&mut delayed.regions, rect);
            delayed.options.merge(&options);
            tracing::trace!(wid = self.wid, regions = delayed.regions.len(), "merged into delayed region");
            return;
        }

        let batching = self.must_batch(now);
        let mut delay = if batching { self.batch.delay } else { 0 };
        if batching && self.stats.since_resize(now).is_some_and(|d| d < RESIZE_WINDOW) {
            delay += RESIZE_DELAY_MS;
        }
        let encoding = options.encoding.clone().unwrap_or_else(|| self.encoding.clone());
        self.delayed = Some(DelayedRegion {
            damage_time: now,
            regions: vec![rect],
            encoding,
            options,
        });
        self.batch.record_delay(now, delay);
        self.expire_timer = Some(self.timers.schedule(now + Duration::from_millis(delay), SourceTimer::Expire));
        tracing::trace!(wid = self.wid, sequence = self.sequence, delay, batching, "new delayed region");
    }

    fn must_batch(&self, now: Instant) -> bool {
        if self.batch.always || self.backlog > self.batch.max_backlog {
            return true;
        }
        let (events, pixels) = self.stats.recent_load(now, self.batch.time_unit);
        events > self.batch.max_events || pixels > self.batch.max_pixels
    }

    /// Fire due timers and return whatever is ready for encoding.
    pub fn poll(&mut self, now: Instant) -> Vec<EncodeQueueItem> {
        let mut out = Vec::new();
        while let Some((handle, timer)) = self.timers.pop_due(now) {
            match timer {
                SourceTimer::Expire => {
                    if self.expire_timer == Some(handle) {
                        self.expire_timer = None;
                    }
                    out.extend(self.expire_delayed_region(now));
                }
                SourceTimer::EncodeQueue => {
                    self.encode_queue_due = None;
                    out.extend(self.encode_from_queue(now));
                }
            }
        }
        for regions in self.subregion.poll_refresh(now) {
            out.extend(self.refresh_subregion(regions, now));
        }
        out
    }

    fn expire_delayed_region(&mut self, now: Instant) -> Vec<EncodeQueueItem> {
        let Some(delayed) = self.delayed.take() else {
            return Vec::new();
        };
        let actual = now.saturating_duration_since(delayed.damage_time).as_millis() as u64;
        self.batch.record_actual_delay(now, actual);
        self.send_delayed_regions(delayed.damage_time, delayed.regions, &delayed.encoding, &delayed.options, now)
    }

    // ── Routing ──────────────────────────────────────────────────

    /// Route the regions of an expired delayed region.
    pub fn send_delayed_regions(
        &mut self,
        damage_time: Instant,
        regions: Vec<Rectangle>,
        encoding: &str,
        options: &DamageOptions,
        now: Instant,
    ) -> Vec<EncodeQueueItem> {
        if self.gate.is_cancelled(self.sequence) {
            return Vec::new();
        }
        let (ww, wh) = self.window_dimensions;
        self.subregion
            .identify(ww, wh, self.stats.damage_events_count, self.stats.events(), now);

        let quality = options.quality.unwrap_or(self.quality);
        if options.novideo || !self.registry.is_video_encoding(encoding) {
            let picture = self.picture_encoding(encoding);
            return self.send_nonvideo(damage_time, &regions, &picture, options, quality, now);
        }
        let Some(vr) = self.subregion.rectangle else {
            let mut out = Vec::new();
            for r in &regions {
                let enc = self.get_best_encoding(r, encoding);
                out.extend(self.process_damage_region(damage_time, *r, &enc, options, quality, false, 0, now));
            }
            return out;
        };

        let Some(actual_vr) = find_video_region(&vr, &regions) else {
            tracing::trace!(wid = self.wid, region = %vr, "video region not found in damage");
            let picture = self.picture_encoding(encoding);
            return self.send_nonvideo(damage_time, &regions, &picture, options, quality, now);
        };
        if actual_vr.right() > ww || actual_vr.bottom() > wh {
            tracing::debug!(wid = self.wid, region = %actual_vr, "video region partially outside the window");
            let picture = self.picture_encoding(encoding);
            return self.send_nonvideo(damage_time, &regions, &picture, options, quality, now);
        }

        let min_q = self.policy.video.min_quality;
        let video_q = ((quality as u32 * 70 / 100) as u8).max(min_q);
        let mut out = self.process_damage_region(damage_time, actual_vr, encoding, options, video_q, true, 0, now);
        if video_q < 100 {
            self.subregion.add_video_refresh(actual_vr, now);
        }

        let trimmed: Vec<Rectangle> = regions.iter().flat_map(|r| r.subtract_rect(&actual_vr)).collect();
        if trimmed.is_empty() {
            return out;
        }
        let event_count = self.stats.damage_events_count.saturating_sub(self.subregion.set_at);
        let hold = if event_count < NON_VIDEO_HOLD_EVENTS {
            0
        } else {
            let elapsed = now.saturating_duration_since(damage_time).as_millis() as u64;
            let wait = self.subregion.non_max_wait.as_millis() as u64;
            (self.batch.delay * 4).max(50).min(wait.saturating_sub(elapsed))
        };
        if hold <= MIN_HOLD_MS {
            let picture = self.picture_encoding(encoding);
            let q = ((quality as u32 * 140 / 100).min(100)) as u8;
            out.extend(self.send_nonvideo(damage_time, &trimmed, &picture, options, q, now));
        } else {
            tracing::trace!(wid = self.wid, hold, "holding back non-video regions");
            self.delayed = Some(DelayedRegion {
                damage_time,
                regions: trimmed,
                encoding: encoding.to_string(),
                options: options.clone(),
            });
            self.expire_timer = Some(self.timers.schedule(now + Duration::from_millis(hold), SourceTimer::Expire));
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn send_nonvideo(
        &mut self,
        damage_time: Instant,
        regions: &[Rectangle],
        encoding: &str,
        options: &DamageOptions,
        quality: u8,
        now: Instant,
    ) -> Vec<EncodeQueueItem> {
        let mut opts = options.clone();
        opts.novideo = true;
        let mut out = Vec::new();
        for r in regions {
            out.extend(self.process_damage_region(damage_time, *r, encoding, &opts, quality, false, 0, now));
        }
        out
    }

    /// Repaint lossy video output at full quality.
    fn refresh_subregion(&mut self, regions: Vec<Rectangle>, now: Instant) -> Vec<EncodeQueueItem> {
        let encoding = self.picture_encoding(&self.encoding.clone());
        let opts = DamageOptions {
            novideo: true,
            auto_refresh: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        for r in regions {
            out.extend(self.process_damage_region(now, r, &encoding, &opts, 100, false, 0, now));
        }
        out
    }

    /// Best picture encoding, preferring `encoding` when it is one.
    fn picture_encoding(&self, encoding: &str) -> String {
        if self.registry.picture_encoder(encoding).is_some() {
            return encoding.to_string();
        }
        self.registry
            .picture_encodings()
            .into_iter()
            .next()
            .unwrap_or_else(|| crate::codecs::rgb::ENCODING.to_string())
    }

    /// Video for regions large enough to be worth it, pictures otherwise.
    fn get_best_encoding(&self, rect: &Rectangle, encoding: &str) -> String {
        if self.registry.is_video_encoding(encoding) && rect.width >= MIN_W && rect.height >= MIN_H {
            return encoding.to_string();
        }
        self.picture_encoding(encoding)
    }

    // ── Capture ──────────────────────────────────────────────────

    /// Capture one region and hand it on (directly or via AV-sync).
    #[allow(clippy::too_many_arguments)]
    pub fn process_damage_region(
        &mut self,
        damage_time: Instant,
        rect: Rectangle,
        encoding: &str,
        options: &DamageOptions,
        quality: u8,
        av_sync: bool,
        flush: u32,
        now: Instant,
    ) -> Vec<EncodeQueueItem> {
        if rect.is_empty() {
            return Vec::new();
        }
        self.sequence += 1;
        let sequence = self.sequence;
        if self.gate.is_cancelled(sequence) {
            return Vec::new();
        }
        let Some(mut frame) = self.source.get_image(rect) else {
            tracing::debug!(wid = self.wid, region = %rect, "no pixel data");
            return Vec::new();
        };
        let av_delay = self.get_frame_encode_delay(av_sync);
        if !frame.is_thread_safe() || av_delay > 0 {
            frame.freeze();
        }
        self.stats.record_latency(now, now.saturating_duration_since(damage_time));

        let item = EncodeQueueItem {
            wid: self.wid,
            width: frame.width,
            height: frame.height,
            damage_time,
            enqueue_time: now,
            frame,
            encoding: encoding.to_string(),
            sequence,
            options: self.snapshot(options, quality, av_sync, now),
            flush,
            gate: Arc::clone(&self.gate),
            av_due: (av_delay > 0).then(|| now + Duration::from_millis(av_delay)),
        };
        tracing::trace!(
            wid = self.wid,
            sequence,
            encoding,
            width = item.width,
            height = item.height,
            av_delay,
            "captured region"
        );
        if av_delay == 0 {
            return vec![item];
        }
        self.encode_queue.push_back(item);
        self.schedule_encode_from_queue(now + Duration::from_millis(av_delay));
        Vec::new()
    }

    fn snapshot(&self, options: &DamageOptions, quality: u8, av_sync: bool, now: Instant) -> EncodeOptions {
        let is_video = self.subregion.is_video(self.stats.damage_events_count, self.content_video);
        EncodeOptions {
            quality,
            speed: options.speed.unwrap_or(self.speed),
            min_quality: self.policy.video.min_quality,
            min_speed: self.policy.video.min_speed,
            batch_delay: self.batch.delay,
            content_video: self.content_video,
            content_text: self.content_text,
            fullscreen: self.fullscreen,
            maximized: self.maximized,
            video_region: self.subregion.rectangle,
            video_fps: self.subregion.fps,
            is_video,
            detecting: self.subregion.rectangle.is_some() && !is_video,
            scroll: self.scroll,
            bandwidth_limit: self.bandwidth_limit,
            window_size: self.window_dimensions,
            damage_events: self.stats.damage_events_count,
            last_resized: self.stats.last_resized,
            last_scroll: self.stats.last_scroll,
            novideo: options.novideo,
            refresh: options.auto_refresh && quality >= 100,
            av_sync: av_sync && self.policy.av_sync.enabled,
        }
        .with_fps_fallback(self.stats.fps(now))
    }

    // ── AV-sync ──────────────────────────────────────────────────

    /// Delay for a frame, in milliseconds. Zero bypasses the queue.
    pub fn get_frame_encode_delay(&self, av_sync: bool) -> u64 {
        let p = &self.policy.av_sync;
        if !p.enabled || !av_sync || self.encode_queue.len() >= p.queue_size {
            return 0;
        }
        p.delay_ms
    }

    fn schedule_encode_from_queue(&mut self, due: Instant) {
        if let Some((current, handle)) = self.encode_queue_due {
            if current <= due {
                return;
            }
            self.timers.cancel(handle);
        }
        let handle = self.timers.schedule(due, SourceTimer::EncodeQueue);
        self.encode_queue_due = Some((due, handle));
    }

    /// Release at most one due item from the AV-sync queue.
    pub fn encode_from_queue(&mut self, now: Instant) -> Vec<EncodeQueueItem> {
        let gate = Arc::clone(&self.gate);
        let before = self.encode_queue.len();
        self.encode_queue.retain(|item| !gate.is_cancelled(item.sequence));
        if self.encode_queue.len() != before {
            tracing::trace!(wid = self.wid, dropped = before - self.encode_queue.len(), "dropped cancelled frames");
        }
        let bypass = self.encode_queue.len() >= self.policy.av_sync.queue_size;
        let due_index = self
            .encode_queue
            .iter()
            .position(|item| bypass || item.av_due.is_none_or(|d| d <= now));
        let mut out = Vec::new();
        if let Some(i) = due_index {
            if let Some(item) = self.encode_queue.remove(i) {
                out.push(item);
            }
        }
        let next = self.encode_queue.iter().filter_map(|item| item.av_due).min();
        if let Some(next) = next {
            let min_gap = Duration::from_millis(self.policy.av_sync.min_gap_ms);
            let wait = next.saturating_duration_since(now).max(min_gap);
            self.schedule_encode_from_queue(now + wait);
        }
        out
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Drop everything pending; in-flight sequences are cancelled.
    pub fn cancel_damage(&mut self) {
        tracing::debug!(wid = self.wid, sequence = self.sequence, "cancelling damage");
        self.gate.cancel(self.sequence);
        self.delayed = None;
        self.expire_timer = None;
        self.encode_queue.clear();
        self.encode_queue_due = None;
        self.timers.clear();
        self.subregion.cancel_refresh_timer();
    }

    pub fn resize(&mut self, width: u32, height: u32, now: Instant) {
        self.cancel_damage();
        self.subregion.reset(now);
        self.stats.record_resize(now);
        self.window_dimensions = (width, height);
    }

    /// Change the preferred encoding.
    pub fn set_encoding(&mut self, encoding: &str, now: Instant) {
        if encoding == self.encoding {
            return;
        }
        self.encoding = encoding.to_string();
        let video = self.registry.is_video_encoding(encoding);
        if !video {
            self.subregion.reset(now);
        }
        self.subregion.set_enabled(video);
    }

    /// Recompute the batch delay from the output backlog, damage latency
    /// and event rate.
    pub fn update_batch_delay(&mut self, now: Instant, backlog: usize) {
        self.backlog = backlog;
        if !self.batch.due_for_update(now) {
            return;
        }
        let (events, _) = self.stats.recent_load(now, self.batch.time_unit);
        let target = Duration::from_millis(self.batch.delay + RESIZE_DELAY_MS);
        let factors = [
            batch::backlog_factor(backlog),
            batch::latency_factor(self.stats.avg_latency(), target),
            batch::event_rate_factor(events, self.batch.max_events),
        ];
        self.batch.update_delay(&factors, now);
        tracing::trace!(wid = self.wid, delay = self.batch.delay, backlog, "batch delay updated");
    }
}

impl EncodeOptions {
    /// Use the window frame rate when no region rate is known.
    fn with_fps_fallback(mut self, fps: u32) -> Self {
        if self.video_fps == 0 {
            self.video_fps = fps;
        }
        self
    }
}

/// Find the video region among damaged rectangles.
///
/// Exact match, then at least 40% of the region covered, then a unique
/// rectangle of the same size (or one sharing a coordinate).
fn find_video_region(vr: &Rectangle, regions: &[Rectangle]) -> Option<Rectangle> {
    if regions.contains(vr) {
        return Some(*vr);
    }
    let inter: Vec<Rectangle> = regions.iter().filter_map(|r| vr.intersection(r)).collect();
    if let Some(in_region) = merge_all(&inter) {
        if in_region.area() * 100 >= vr.area() * 40 {
            return Some(*vr);
        }
    }
    let same: Vec<&Rectangle> = regions.iter().filter(|r| r.width == vr.width && r.height == vr.height).collect();
    match same.as_slice() {
        [r] => Some(**r),
        [] => None,
        many => {
            let same_c: Vec<&&Rectangle> = many.iter().filter(|r| r.x == vr.x || r.y == vr.y).collect();
            match same_c.as_slice() {
                [r] => Some(***r),
                _ => None,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::{EncoderFactory, EncoderParams, EncoderSpec, VideoEncoder};
    use crate::error::EncodeError;
    use crate::image::PixelFormat;
    use crate::policy::AvSyncPolicy;

    struct Solid {
        w: u32,
        h: u32,
    }

    impl FrameSource for Solid {
        fn dimensions(&self) -> (u32, u32) {
            (self.w, self.h)
        }

        fn get_image(&mut self, rect: Rectangle) -> Option<Frame> {
            let r = rect.clamp_to(self.w, self.h)?;
            let data = vec![0x80u8; (r.width * r.height * 4) as usize];
            Some(Frame::packed(r.x, r.y, r.width, r.height, PixelFormat::Bgrx, r.width * 4, data).borrowed())
        }
    }

    struct NoEncoder;

    impl EncoderFactory for NoEncoder {
        fn create(&self, _: &EncoderParams) -> Result<Box<dyn VideoEncoder>, EncodeError> {
            Err(EncodeError::Unsupported("test".into()))
        }
    }

    fn video_registry() -> CodecRegistry {
        let mut reg = CodecRegistry::with_defaults();
        reg.add_encoder(EncoderSpec {
            codec_type: "test".into(),
            encoding: "h264".into(),
            input_format: PixelFormat::Yuv420p,
            output_formats: vec![PixelFormat::Yuv420p],
            min_width: 16,
            min_height: 16,
            max_width: 4096,
            max_height: 4096,
            width_mask: !1,
            height_mask: !1,
            can_scale: false,
            has_lossless_mode: false,
            quality: 50,
            speed: 50,
            setup_cost: 10,
            cpu_cost: 10,
            gpu_cost: 0,
            factory: Arc::new(NoEncoder),
        });
        reg
    }

    fn window(policy: PipelinePolicy, now: Instant) -> WindowSource {
        let policy = Arc::new(policy);
        let batch = BatchConfig::from_policy(&policy.batch);
        WindowSource::new(
            1,
            Box::new(Solid { w: 640, h: 480 }),
            Arc::clone(&policy),
            video_registry(),
            &ClientCapabilities::default(),
            &batch,
            now,
        )
    }

    #[test]
    fn unbatched_damage_fires_on_next_poll() {
        let t0 = Instant::now();
        let mut ws = window(PipelinePolicy::default(), t0);
        assert_eq!(ws.encoding(), "h264");
        ws.damage(Rectangle::new(0, 0, 64, 64), DamageOptions::default(), t0);
        assert_eq!(ws.next_deadline(), Some(t0));
        let items = ws.poll(t0);
        assert_eq!(items.len(), 1);
        // small region: picture encoding
        assert_eq!(items[0].encoding, "rgb");
        assert!(items[0].frame.is_thread_safe());
        assert!(items[0].sequence > 1);
        assert!(!ws.has_delayed());
    }

    #[test]
    fn damage_merges_into_delayed_region() {
        let t0 = Instant::now();
        let mut policy = PipelinePolicy::default();
        policy.batch.always = true;
        let mut ws = window(policy, t0);
        ws.damage(Rectangle::new(0, 0, 200, 200), DamageOptions::default(), t0);
        ws.damage(Rectangle::new(300, 300, 200, 100), DamageOptions::default(), t0);
        assert!(ws.poll(t0 + Duration::from_millis(10)).is_empty());
        let items = ws.poll(t0 + Duration::from_millis(60));
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.encoding == "h264"));
        assert!(items[0].sequence < items[1].sequence);
    }

    #[test]
    fn override_replaces_options() {
        let mut a = DamageOptions {
            quality: Some(10),
            novideo: true,
            ..Default::default()
        };
        a.merge(&DamageOptions {
            quality: Some(90),
            ..Default::default()
        });
        assert_eq!(a.quality, Some(10));
        a.merge(&DamageOptions {
            quality: Some(90),
            override_options: true,
            ..Default::default()
        });
        assert_eq!(a.quality, Some(90));
        assert!(!a.novideo);
    }

    #[test]
    fn novideo_goes_to_picture_encoder() {
        let t0 = Instant::now();
        let mut ws = window(PipelinePolicy::default(), t0);
        let opts = DamageOptions {
            novideo: true,
            ..Default::default()
        };
        ws.damage(Rectangle::new(0, 0, 640, 480), opts, t0);
        let items = ws.poll(t0);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].encoding, "rgb");
        assert!(items[0].options.novideo);
    }

    #[test]
    fn cancel_drops_pending_work() {
        let t0 = Instant::now();
        let mut policy = PipelinePolicy::default();
        policy.batch.always = true;
        let mut ws = window(policy, t0);
        ws.damage(Rectangle::new(0, 0, 200, 200), DamageOptions::default(), t0);
        ws.cancel_damage();
        assert!(!ws.has_delayed());
        assert!(ws.poll(t0 + Duration::from_secs(1)).is_empty());
        assert!(ws.gate().is_cancelled(ws.sequence()));

        ws.damage(Rectangle::new(0, 0, 200, 200), DamageOptions::default(), t0);
        let items = ws.poll(t0 + Duration::from_secs(1));
        assert_eq!(items.len(), 1);
        assert!(!items[0].is_cancelled());
    }

    #[test]
    fn av_sync_queue_delays_and_bypasses() {
        let t0 = Instant::now();
        let policy = PipelinePolicy {
            av_sync: AvSyncPolicy {
                enabled: true,
                delay_ms: 100,
                queue_size: 2,
                min_gap_ms: 5,
            },
            ..Default::default()
        };
        let mut ws = window(policy, t0);
        let opts = DamageOptions::default();
        let r = Rectangle::new(0, 0, 200, 200);
        assert!(ws.process_damage_region(t0, r, "h264", &opts, 50, true, 0, t0).is_empty());
        assert!(ws.process_damage_region(t0, r, "h264", &opts, 50, true, 0, t0).is_empty());
        assert_eq!(ws.av_queue_len(), 2);
        // queue full: bypass
        assert_eq!(ws.process_damage_region(t0, r, "h264", &opts, 50, true, 0, t0).len(), 1);

        assert!(ws.poll(t0 + Duration::from_millis(50)).is_empty());
        let first = ws.poll(t0 + Duration::from_millis(100));
        assert_eq!(first.len(), 1);
        let second = ws.poll(t0 + Duration::from_millis(105));
        assert_eq!(second.len(), 1);
        assert!(first[0].sequence < second[0].sequence);
        assert_eq!(ws.av_queue_len(), 0);
    }

    #[test]
    fn av_sync_queue_skips_cancelled() {
        let t0 = Instant::now();
        let policy = PipelinePolicy {
            av_sync: AvSyncPolicy {
                enabled: true,
                delay_ms: 100,
                queue_size: 10,
                min_gap_ms: 5,
            },
            ..Default::default()
        };
        let mut ws = window(policy, t0);
        let r = Rectangle::new(0, 0, 200, 200);
        ws.process_damage_region(t0, r, "h264", &DamageOptions::default(), 50, true, 0, t0);
        ws.gate().cancel(ws.sequence());
        assert!(ws.encode_from_queue(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(ws.av_queue_len(), 0);
    }

    #[test]
    fn video_region_lookup() {
        let vr = Rectangle::new(100, 100, 320, 240);
        assert_eq!(find_video_region(&vr, &[vr]), Some(vr));
        assert_eq!(
            find_video_region(&vr, &[Rectangle::new(100, 100, 320, 120)]),
            Some(vr)
        );
        let moved = Rectangle::new(0, 400, 320, 240);
        assert_eq!(find_video_region(&vr, &[moved]), Some(moved));
        assert_eq!(find_video_region(&vr, &[Rectangle::new(0, 0, 10, 10)]), None);
    }

    #[test]
    fn set_encoding_disables_region() {
        let t0 = Instant::now();
        let mut ws = window(PipelinePolicy::default(), t0);
        assert!(ws.subregion().enabled);
        ws.set_encoding("rgb", t0);
        assert!(!ws.subregion().enabled);
        ws.set_encoding("h264", t0);
        assert!(ws.subregion().enabled);
    }

    #[test]
    fn batch_delay_tracks_backlog() {
        let t0 = Instant::now();
        let mut ws = window(PipelinePolicy::default(), t0);
        let start = ws.batch().delay;
        ws.update_batch_delay(t0, 20);
        assert!(ws.batch().delay > start);
        let raised = ws.batch().delay;
        // rate limited
        ws.update_batch_delay(t0 + Duration::from_millis(10), 20);
        assert_eq!(ws.batch().delay, raised);
    }
}
