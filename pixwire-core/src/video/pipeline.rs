//! Encode side of the pipeline: one [`WindowVideoEncoder`] per window.
//!
//! Runs on the encode thread. Turns [`EncodeQueueItem`]s into draw packets,
//! owning the window's colourspace converter and video encoder.
//!
//! ```text
//!   Idle ──setup──▶ PipelineReady ──compress──▶ Encoding ─┬─▶ PipelineReady
//!    ▲                                                    └─▶ FlushPending ──flush──▶ PipelineReady
//!    └──────────── idle timeout / clean ◀───────────── any state
//!
//!   suspend() ─▶ Suspended ──next encode──▶ setup
//! ```
//!
//! | Path      | When                                                        |
//! |-----------|-------------------------------------------------------------|
//! | picture   | the item's encoding is not a video encoding                 |
//! | scroll    | mostly unchanged rows moved vertically (see [`ScrollData`]) |
//! | video     | a scored (csc, encoder) pipeline accepts the frame          |
//! | fallback  | no pipeline, transient codec error, first frame buffered    |

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::caps::ClientCapabilities;
use crate::codecs::{
    CodecRegistry, ColorspaceConverter, EncoderParams, PictureEncoder, PictureParams, VideoEncoder,
};
use crate::compression::{self, Algorithm, CompressedPayload};
use crate::error::EncodeError;
use crate::image::{Frame, PixelFormat};
use crate::packet::{DrawData, DrawPacket, ScrollRect, keys};
use crate::policy::PipelinePolicy;
use crate::video::cancel::SequenceGate;
use crate::video::scaling::{ScalingContext, ScalingDecider};
use crate::video::scoring::{PipelineIdentity, PipelineOption, PipelineScorer, ScoreRequest};
use crate::video::scroll::{ScrollData, ScrollMatch};
use crate::video::source::{EncodeOptions, EncodeQueueItem};
use crate::video::timer::{TimerHandle, TimerQueue};

/// Smallest frame worth running scroll detection on.
const SCROLL_MIN_SIZE: u32 = 128;
/// Below this quality the client copy is too lossy to scroll from.
const SCROLL_MIN_QUALITY: u8 = 20;

/// Lifecycle of a window's video pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    PipelineReady,
    Encoding,
    /// The encoder holds frames back; a flush is scheduled.
    FlushPending,
    Suspended,
}

// ── ActivePipeline ───────────────────────────────────────────────

/// The instantiated converter and encoder for one geometry.
///
/// Dropping it cleans both instances.
pub struct ActivePipeline {
    csc: Option<Box<dyn ColorspaceConverter>>,
    encoder: Box<dyn VideoEncoder>,
    option: PipelineOption,
    width_mask: u32,
    height_mask: u32,
    started: Instant,
}

impl ActivePipeline {
    pub fn option(&self) -> &PipelineOption {
        &self.option
    }

    pub fn identity(&self) -> PipelineIdentity {
        PipelineIdentity::of(&self.option)
    }

    pub fn masked(&self, w: u32, h: u32) -> (u32, u32) {
        (w & self.width_mask, h & self.height_mask)
    }

    /// Format name of what the encoder is fed.
    fn csc_name(&self) -> &'static str {
        match &self.csc {
            Some(c) => c.dst_format().name(),
            None => self.encoder.src_format().name(),
        }
    }

    /// Size the client sees the stream at, when it differs from the source.
    fn scaled_size(&self) -> Option<(u32, u32)> {
        let o = &self.option;
        ((o.encoder_width, o.encoder_height) != (o.csc_width, o.csc_height))
            .then_some((o.encoder_width, o.encoder_height))
    }
}

impl Drop for ActivePipeline {
    fn drop(&mut self) {
        if let Some(csc) = &mut self.csc {
            csc.clean();
        }
        self.encoder.clean();
    }
}

/// What the flush packet needs once the encoder drains.
#[derive(Debug, Clone)]
struct FlushData {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    encoding: String,
    frame: u64,
    quality: u8,
    speed: u8,
    sequence: u64,
    gate: Arc<SequenceGate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineTimer {
    Flush,
    Idle,
}

// ── WindowVideoEncoder ───────────────────────────────────────────

/// Encode-thread state for one window.
pub struct WindowVideoEncoder {
    pub wid: u32,
    policy: Arc<PipelinePolicy>,
    caps: Arc<ClientCapabilities>,
    scorer: PipelineScorer,
    scaler: ScalingDecider,
    compressors: Vec<Algorithm>,

    pipeline: Option<ActivePipeline>,
    state: EncoderState,
    scroll_data: ScrollData,

    timers: TimerQueue<PipelineTimer>,
    flush_timer: Option<TimerHandle>,
    idle_timer: Option<TimerHandle>,
    flush_data: Option<FlushData>,

    /// `(encoding, src_format)` pairs no pipeline could handle.
    no_match: HashSet<(String, PixelFormat)>,
    /// Keys of failures already logged at warn level.
    logged: HashSet<String>,
    last_window_size: (u32, u32),
    last_encoding: String,
}

impl WindowVideoEncoder {
    /// `registry` must already be the client's view.
    pub fn new(wid: u32, policy: Arc<PipelinePolicy>, registry: CodecRegistry, caps: Arc<ClientCapabilities>) -> Self {
        let compressors = compression::parse_enabled(&policy.compression.compressors);
        Self {
            wid,
            scorer: PipelineScorer::new(Arc::clone(&policy), registry),
            scaler: ScalingDecider::new(Arc::clone(&policy)),
            compressors,
            policy,
            caps,
            pipeline: None,
            state: EncoderState::Idle,
            scroll_data: ScrollData::new(),
            timers: TimerQueue::new(),
            flush_timer: None,
            idle_timer: None,
            flush_data: None,
            no_match: HashSet::new(),
            logged: HashSet::new(),
            last_window_size: (0, 0),
            last_encoding: String::new(),
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn pipeline(&self) -> Option<&ActivePipeline> {
        self.pipeline.as_ref()
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_data.is_some()
    }

    fn registry(&self) -> &CodecRegistry {
        self.scorer.registry()
    }

    /// Earliest flush or idle deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire due timers. Flushes may produce packets.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<DrawPacket> {
        let mut out = Vec::new();
        while let Some((handle, timer)) = self.timers.pop_due(now) {
            match timer {
                PipelineTimer::Flush => {
                    if self.flush_timer == Some(handle) {
                        self.flush_timer = None;
                        out.extend(self.do_flush_video_encoder(now));
                    }
                }
                PipelineTimer::Idle => {
                    if self.idle_timer == Some(handle) {
                        self.idle_timer = None;
                        tracing::debug!(wid = self.wid, "video encoder idle, cleaning pipeline");
                        self.clean();
                    }
                }
            }
        }
        out
    }

    /// Release the pipeline and every pending timer.
    pub fn clean(&mut self) {
        if let Some(p) = self.pipeline.take() {
            tracing::debug!(wid = self.wid, pipeline = %p.option.describe(), "cleaning video pipeline");
        }
        self.cancel_flush();
        if let Some(h) = self.idle_timer.take() {
            self.timers.cancel(h);
        }
        self.state = EncoderState::Idle;
    }

    /// Clean and stay down until the next encode.
    pub fn suspend(&mut self) {
        self.clean();
        self.state = EncoderState::Suspended;
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Encode one captured region.
    pub fn encode(&mut self, item: EncodeQueueItem, now: Instant) -> Vec<DrawPacket> {
        if item.is_cancelled() {
            tracing::trace!(wid = self.wid, sequence = item.sequence, "dropping cancelled item");
            return Vec::new();
        }
        self.track_changes(&item);

        if !self.registry().is_video_encoding(&item.encoding) {
            return match self.encode_picture(&item.frame, &item.encoding, &item, item.options.quality, item.flush) {
                Ok(p) => {
                    self.invalidate_scroll(&item.frame, item.options.quality);
                    vec![p]
                }
                Err(e) => {
                    self.log_failure(&e, &item.encoding);
                    Vec::new()
                }
            };
        }

        if let Some(m) = self.may_use_scrolling(&item) {
            return self.encode_scrolling(&item, &m);
        }

        match self.do_video_encode(&item, now) {
            Ok(packets) => packets,
            Err(EncodeError::Cancelled(seq)) => {
                tracing::trace!(wid = self.wid, sequence = seq, "cancelled during encode");
                Vec::new()
            }
            Err(EncodeError::Closed(codec)) => {
                tracing::debug!(wid = self.wid, codec = %codec, "encoder closed, dropping frame");
                self.clean();
                Vec::new()
            }
            Err(e) if e.is_transient() => {
                if matches!(e, EncodeError::Codec { .. }) {
                    self.clean();
                }
                self.video_fallback(&item, &e)
            }
            Err(e) => {
                self.log_failure(&e, &item.encoding);
                Vec::new()
            }
        }
    }

    /// Forget capability mismatches after a resize or an encoding change.
    fn track_changes(&mut self, item: &EncodeQueueItem) {
        let size = item.options.window_size;
        if size != self.last_window_size || item.encoding != self.last_encoding {
            if !self.no_match.is_empty() {
                tracing::debug!(wid = self.wid, "clearing pipeline mismatch cache");
                self.no_match.clear();
            }
            if size != self.last_window_size {
                self.scaler.reset();
            }
            self.last_window_size = size;
            self.last_encoding.clone_from(&item.encoding);
        }
    }

    // ── Video ────────────────────────────────────────────────────

    fn do_video_encode(&mut self, item: &EncodeQueueItem, now: Instant) -> Result<Vec<DrawPacket>, EncodeError> {
        let frame = &item.frame;
        let (w, h, src_format) = (frame.width, frame.height, frame.format);
        let key = (item.encoding.clone(), src_format);
        if self.no_match.contains(&key) {
            return Err(EncodeError::NoPipeline {
                format: src_format.to_string(),
                width: w,
                height: h,
            });
        }

        let encodings = self.candidate_encodings(&item.encoding);
        if let Err(e) = self.check_pipeline(&encodings, w, h, src_format, &item.options, now) {
            if matches!(e, EncodeError::NoPipeline { .. }) {
                self.no_match.insert(key);
            }
            return Err(e);
        }
        // the next compress drains whatever the encoder holds
        if let Some(handle) = self.flush_timer.take() {
            self.timers.cancel(handle);
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Err(EncodeError::NoPipeline {
                format: src_format.to_string(),
                width: w,
                height: h,
            });
        };

        let (mw, mh) = pipeline.masked(w, h);
        let cropped = if (mw, mh) != (w, h) {
            frame.get_sub_image(0, 0, mw, mh)?
        } else {
            frame.clone()
        };
        if item.is_cancelled() {
            return Err(EncodeError::Cancelled(item.sequence));
        }

        self.state = EncoderState::Encoding;
        let (quality, speed) = (item.options.quality, item.options.speed);
        let converted = match &mut pipeline.csc {
            Some(csc) => csc.convert(&cropped),
            None => Ok(cropped),
        };
        let result = converted.and_then(|f| pipeline.encoder.compress(&f, quality, speed));
        self.state = EncoderState::PipelineReady;
        let out = result?;

        let encoding = pipeline.encoder.encoding().to_string();
        let codec_type = pipeline.encoder.codec_type().to_string();
        let csc_name = pipeline.csc_name();
        let scaled_size = pipeline.scaled_size();
        let pts = now.saturating_duration_since(pipeline.started).as_millis() as u64;

        if scaled_size.is_some() || quality < SCROLL_MIN_QUALITY {
            self.scroll_data.free();
        }
        self.schedule_idle(&item.options, now);
        if out.delayed > 0 {
            self.schedule_video_encoder_flush(item, &encoding, mw, mh, out.frame, now);
        } else {
            self.flush_data = None;
        }

        let edges = edge_regions(w, h, mw, mh);
        let mut flush = item.flush + edges.len() as u32;
        let mut packets = Vec::new();
        match out.data {
            Some(data) => {
                let mut packet = DrawPacket::new(
                    self.wid,
                    frame.x,
                    frame.y,
                    mw,
                    mh,
                    encoding.as_str(),
                    DrawData::Compressed(CompressedPayload::encoded(encoding.as_str(), data)),
                );
                packet.options.extend(out.options);
                packet.set_option(keys::FRAME, out.frame);
                packet.set_option(keys::PTS, pts);
                packet.set_option(keys::QUALITY, quality);
                packet.set_option(keys::SPEED, speed);
                packet.set_option(keys::CSC, csc_name);
                packet.set_option(keys::ENCODER, codec_type.as_str());
                if let Some(size) = scaled_size {
                    packet.set_option(keys::SCALED_SIZE, size);
                }
                if out.delayed > 0 {
                    packet.set_option(keys::DELAYED, out.delayed);
                }
                if flush > 0 {
                    packet.set_option(keys::FLUSH, flush);
                }
                packet.set_option(keys::DAMAGE_SEQUENCE, item.sequence);
                tracing::trace!(wid = self.wid, %packet, frame = out.frame, "video frame");
                packets.push(packet);
            }
            None if out.frame == 0 => {
                // the whole frame goes out as a picture, edges included
                tracing::debug!(wid = self.wid, delayed = out.delayed, "first frame buffered");
                let reason = EncodeError::Codec {
                    codec: codec_type,
                    reason: "first frame buffered".into(),
                };
                return Ok(self.video_fallback(item, &reason));
            }
            None => {
                tracing::trace!(wid = self.wid, delayed = out.delayed, "frame buffered by encoder");
            }
        }

        for (ex, ey, ew, eh) in edges {
            flush = flush.saturating_sub(1);
            let sub = frame.get_sub_image(ex, ey, ew, eh)?;
            let enc = self.fallback_encoding().unwrap_or_default();
            match self.encode_picture(&sub, &enc, item, quality, flush) {
                Ok(p) => packets.push(p),
                Err(e) => self.log_failure(&e, &enc),
            }
        }
        Ok(packets)
    }

    /// The item's encoding first, then every other video encoding.
    fn candidate_encodings(&self, preferred: &str) -> Vec<String> {
        let mut out = vec![preferred.to_string()];
        out.extend(self.registry().video_encodings().into_iter().filter(|e| e != preferred));
        out
    }

    /// Keep the active pipeline if it still fits, rebuild it otherwise.
    pub fn check_pipeline(
        &mut self,
        encodings: &[String],
        width: u32,
        height: u32,
        src_format: PixelFormat,
        options: &EncodeOptions,
        now: Instant,
    ) -> Result<(), EncodeError> {
        if self.do_check_pipeline(encodings, width, height, src_format) {
            return Ok(());
        }
        let current = self.pipeline.as_ref().map(ActivePipeline::identity);
        if self.pipeline.is_some() {
            tracing::debug!(wid = self.wid, width, height, src = %src_format, "pipeline no longer matches");
            self.cancel_flush();
            self.pipeline = None;
        }

        let req = ScoreRequest {
            encodings: encodings.to_vec(),
            width,
            height,
            src_format,
            target_quality: options.quality,
            min_quality: options.min_quality,
            target_speed: options.speed,
            min_speed: options.min_speed,
            current,
            fps: options.video_fps,
            in_video_region: options.video_region.is_some(),
            is_video: options.is_video,
            detecting: options.detecting,
            is_text: options.content_text,
        };
        let ctx = self.scaling_context(options, now);
        let scaler = &mut self.scaler;
        let mut scale = |max_w: u32, max_h: u32| scaler.calculate_scaling(width, height, max_w, max_h, &ctx, now);
        let scored = self.scorer.score_options(&req, &mut scale, now);
        self.setup_pipeline(&scored, src_format, options.quality, options.speed, now)
            .map_err(|e| {
                let key = format!("no-pipeline:{src_format}");
                if self.logged.insert(key) {
                    tracing::warn!(
                        wid = self.wid,
                        width,
                        height,
                        src = %src_format,
                        options = scored.len(),
                        "no video pipeline for this format, using picture encodings"
                    );
                } else {
                    tracing::debug!(wid = self.wid, src = %src_format, "no video pipeline");
                }
                e
            })
    }

    /// Whether the active pipeline can encode `width x height` in `src_format`.
    pub fn do_check_pipeline(&self, encodings: &[String], width: u32, height: u32, src_format: PixelFormat) -> bool {
        let Some(p) = &self.pipeline else {
            return false;
        };
        let encoder = &p.encoder;
        if encoder.is_closed() || !encodings.iter().any(|e| e == encoder.encoding()) {
            return false;
        }
        let masked = p.masked(width, height);
        if masked != (p.option.csc_width, p.option.csc_height) {
            tracing::trace!(wid = self.wid, ?masked, "pipeline dimensions changed");
            return false;
        }
        let expected = match &p.csc {
            Some(csc) => {
                if csc.is_closed()
                    || csc.src_format() != src_format
                    || csc.src_size() != masked
                    || csc.dst_format() != encoder.src_format()
                {
                    return false;
                }
                csc.dst_size()
            }
            None => {
                if encoder.src_format() != src_format {
                    return false;
                }
                masked
            }
        };
        encoder.size() == expected
    }

    /// Try each scored option in order.
    fn setup_pipeline(
        &mut self,
        options: &[PipelineOption],
        src_format: PixelFormat,
        quality: u8,
        speed: u8,
        now: Instant,
    ) -> Result<(), EncodeError> {
        let mut last_error = None;
        for option in options {
            match self.setup_pipeline_option(option, src_format, quality, speed, now) {
                Ok(p) => {
                    tracing::debug!(wid = self.wid, pipeline = %option.describe(), "video pipeline ready");
                    self.scaler.commit(option.scaling, now);
                    self.pipeline = Some(p);
                    self.state = EncoderState::PipelineReady;
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(wid = self.wid, pipeline = %option.describe(), error = %e, "pipeline option failed");
                    last_error = Some(e);
                }
            }
        }
        self.state = EncoderState::Idle;
        if let Some(e) = last_error {
            tracing::debug!(wid = self.wid, error = %e, "every pipeline option failed");
        }
        Err(EncodeError::NoPipeline {
            format: src_format.to_string(),
            width: options.first().map(|o| o.csc_width).unwrap_or(0),
            height: options.first().map(|o| o.csc_height).unwrap_or(0),
        })
    }

    fn setup_pipeline_option(
        &self,
        option: &PipelineOption,
        src_format: PixelFormat,
        quality: u8,
        speed: u8,
        now: Instant,
    ) -> Result<ActivePipeline, EncodeError> {
        let spec = &option.encoder;
        let (mut width_mask, mut height_mask) = (spec.width_mask, spec.height_mask);
        let (cw, ch) = (option.csc_width, option.csc_height);

        let csc = match &option.csc {
            Some(cs) => {
                width_mask &= cs.width_mask;
                height_mask &= cs.height_mask;
                let dst = if option.csc_scaling != (1, 1) {
                    (option.encoder_width, option.encoder_height)
                } else {
                    (cw, ch)
                };
                let csc_speed = speed.min(100 - quality.min(100) / 2).max(1);
                Some(cs.factory.create((cw, ch, src_format), (dst.0, dst.1, option.encoder_format), csc_speed)?)
            }
            None => {
                if option.encoder_scaling != (1, 1) && !spec.can_scale {
                    return Err(EncodeError::Unsupported(format!("{} cannot scale", spec.codec_type)));
                }
                None
            }
        };
        let (ew, eh) = csc.as_ref().map(|c| c.dst_size()).unwrap_or((cw, ch));
        let dst_formats: Vec<PixelFormat> = spec
            .output_formats
            .iter()
            .copied()
            .filter(|f| self.caps.accepts_csc(&spec.encoding, *f))
            .collect();
        let params = EncoderParams {
            encoding: spec.encoding.clone(),
            width: ew,
            height: eh,
            src_format: option.encoder_format,
            dst_formats,
            quality,
            speed,
            scaling: option.encoder_scaling,
        };
        let encoder = match spec.factory.create(&params) {
            Ok(e) => e,
            Err(e) => {
                if let Some(mut c) = csc {
                    c.clean();
                }
                return Err(e);
            }
        };
        Ok(ActivePipeline {
            csc,
            encoder,
            option: option.clone(),
            width_mask,
            height_mask,
            started: now,
        })
    }

    fn scaling_context(&self, options: &EncodeOptions, now: Instant) -> ScalingContext {
        ScalingContext {
            quality: options.quality,
            speed: options.speed,
            fps: options.video_fps,
            is_video: options.is_video,
            is_text: options.content_text,
            fullscreen: options.fullscreen,
            maximized: options.maximized,
            damage_events: options.damage_events,
            since_resize: options.last_resized.map(|t| now.saturating_duration_since(t)),
            since_scroll: options.last_scroll.map(|t| now.saturating_duration_since(t)),
            bandwidth_limit: options.bandwidth_limit,
            render_size: self.caps.render_size,
            video_scaling: self.caps.video_scaling,
        }
    }

    // ── B-frames ─────────────────────────────────────────────────

    fn schedule_video_encoder_flush(
        &mut self,
        item: &EncodeQueueItem,
        encoding: &str,
        width: u32,
        height: u32,
        frame: u64,
        now: Instant,
    ) {
        let v = &self.policy.video;
        let delay = (10 * item.options.batch_delay).min(v.flush_max_ms).max(v.flush_min_ms);
        self.flush_data = Some(FlushData {
            x: item.frame.x,
            y: item.frame.y,
            width,
            height,
            encoding: encoding.to_string(),
            frame: frame + 1,
            quality: item.options.quality,
            speed: item.options.speed,
            sequence: item.sequence,
            gate: Arc::clone(&item.gate),
        });
        if let Some(h) = self.flush_timer.take() {
            self.timers.cancel(h);
        }
        self.flush_timer = Some(self.timers.schedule(now + Duration::from_millis(delay), PipelineTimer::Flush));
        self.state = EncoderState::FlushPending;
        tracing::trace!(wid = self.wid, delay, "video encoder flush scheduled");
    }

    fn cancel_flush(&mut self) {
        if let Some(h) = self.flush_timer.take() {
            self.timers.cancel(h);
        }
        if self.flush_data.take().is_some() && self.state == EncoderState::FlushPending {
            self.state = EncoderState::PipelineReady;
        }
    }

    /// Drain frames the encoder held back.
    ///
    /// Takes the pending flush data: a second call without new output is
    /// a no-op.
    pub fn do_flush_video_encoder(&mut self, now: Instant) -> Vec<DrawPacket> {
        let Some(fd) = self.flush_data.take() else {
            return Vec::new();
        };
        if let Some(h) = self.flush_timer.take() {
            self.timers.cancel(h);
        }
        if fd.gate.is_cancelled(fd.sequence) {
            self.state = EncoderState::PipelineReady;
            return Vec::new();
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Vec::new();
        };
        let out = match pipeline.encoder.flush(fd.frame) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(wid = self.wid, error = %e, "video encoder flush failed");
                self.clean();
                return Vec::new();
            }
        };
        self.state = EncoderState::PipelineReady;
        let mut packets = Vec::new();
        if let Some(data) = out.data {
            let mut packet = DrawPacket::new(
                self.wid,
                fd.x,
                fd.y,
                fd.width,
                fd.height,
                fd.encoding.as_str(),
                DrawData::Compressed(CompressedPayload::encoded(fd.encoding.as_str(), data)),
            );
            packet.options.extend(out.options);
            packet.set_option(keys::FRAME, out.frame);
            packet.set_option(keys::QUALITY, fd.quality);
            packet.set_option(keys::SPEED, fd.speed);
            packet.set_option(keys::FLUSH_ENCODER, true);
            if out.delayed > 0 {
                packet.set_option(keys::DELAYED, out.delayed);
            }
            packet.set_option(keys::DAMAGE_SEQUENCE, fd.sequence);
            packets.push(packet);
        }
        if out.delayed > 0 {
            let item_frame = out.frame;
            let delay = self.policy.video.flush_min_ms;
            self.flush_data = Some(FlushData {
                frame: item_frame + 1,
                ..fd
            });
            self.flush_timer = Some(self.timers.schedule(now + Duration::from_millis(delay), PipelineTimer::Flush));
            self.state = EncoderState::FlushPending;
        }
        packets
    }

    fn schedule_idle(&mut self, options: &EncodeOptions, now: Instant) {
        if let Some(h) = self.idle_timer.take() {
            self.timers.cancel(h);
        }
        let v = &self.policy.video;
        let timeout = if options.is_video {
            v.idle_timeout_ms
        } else {
            v.idle_timeout_detect_ms
        };
        self.idle_timer = Some(self.timers.schedule(now + Duration::from_millis(timeout), PipelineTimer::Idle));
    }

    // ── Scrolling ────────────────────────────────────────────────

    /// Run scroll detection when the frame qualifies.
    fn may_use_scrolling(&mut self, item: &EncodeQueueItem) -> Option<ScrollMatch> {
        let frame = &item.frame;
        let o = &item.options;
        if !o.scroll || !self.caps.scrolling || o.content_video || self.flush_data.is_some() {
            return None;
        }
        let bpp = frame.format.bytes_per_pixel()?;
        if frame.width < SCROLL_MIN_SIZE || frame.height < SCROLL_MIN_SIZE || self.fallback_encoding().is_none() {
            return None;
        }
        let m = self.scroll_data.detect(
            frame.pixels(),
            frame.x,
            frame.y,
            frame.width,
            frame.height,
            frame.rowstride(),
            bpp as u32,
            &self.policy.scroll,
        );
        (m.match_percent >= self.policy.scroll.min_percent as u32 && m.has_scroll()).then_some(m)
    }

    /// One `scroll` packet, then the rows that did not move as pictures.
    fn encode_scrolling(&mut self, item: &EncodeQueueItem, m: &ScrollMatch) -> Vec<DrawPacket> {
        let frame = &item.frame;
        let rects: Vec<ScrollRect> = m
            .moving_zones()
            .map(|(offset, old_y, count)| ScrollRect::new(frame.x, frame.y + old_y, frame.width, count, 0, offset))
            .collect();
        let mut flush = item.flush + m.non_scroll.len() as u32;
        tracing::debug!(
            wid = self.wid,
            match_percent = m.match_percent,
            zones = rects.len(),
            non_scroll = m.non_scroll.len(),
            "scroll encoding"
        );

        let mut packet = DrawPacket::new(
            self.wid,
            frame.x,
            frame.y,
            frame.width,
            frame.height,
            "scroll",
            DrawData::Scroll(rects),
        );
        if flush > 0 {
            packet.set_option(keys::FLUSH, flush);
        }
        packet.set_option(keys::DAMAGE_SEQUENCE, item.sequence);
        let mut packets = vec![packet];

        let quality = (item.options.quality as u32 + m.match_percent.max(60) / 2).min(100) as u8;
        let Some(encoding) = self.fallback_encoding() else {
            return packets;
        };
        for &(sy, sh) in &m.non_scroll {
            flush = flush.saturating_sub(1);
            let sub = match frame.get_sub_image(0, sy, frame.width, sh) {
                Ok(s) => s,
                Err(e) => {
                    self.log_failure(&e, "scroll");
                    continue;
                }
            };
            match self.encode_picture(&sub, &encoding, item, quality, flush) {
                Ok(p) => packets.push(p),
                Err(e) => self.log_failure(&e, &encoding),
            }
            self.scroll_data.invalidate(sy, sh);
        }
        packets
    }

    /// Rows painted by a picture encoding cannot be scrolled from.
    fn invalidate_scroll(&mut self, frame: &Frame, quality: u8) {
        let sd = &mut self.scroll_data;
        if !sd.has_history() {
            return;
        }
        if quality < SCROLL_MIN_QUALITY {
            sd.free();
            return;
        }
        let x_overlap = frame.x < sd.x + sd.width && sd.x < frame.x + frame.width;
        let top = frame.y.max(sd.y);
        let bottom = (frame.y + frame.height).min(sd.y + sd.height);
        if x_overlap && top < bottom {
            sd.invalidate(top - sd.y, bottom - top);
        }
    }

    // ── Pictures and fallback ────────────────────────────────────

    fn fallback_encoding(&self) -> Option<String> {
        self.registry().picture_encodings().into_iter().next()
    }

    /// Encode the frame with the best picture encoding.
    pub fn video_fallback(&mut self, item: &EncodeQueueItem, reason: &EncodeError) -> Vec<DrawPacket> {
        let key = format!("fallback:{}:{}", reason.kind(), item.frame.format);
        if self.logged.insert(key) {
            tracing::info!(wid = self.wid, reason = %reason, "using a picture encoding instead of video");
        } else {
            tracing::debug!(wid = self.wid, reason = %reason, "video fallback");
        }
        let Some(encoding) = self.fallback_encoding() else {
            if self.logged.insert("fallback:none".into()) {
                tracing::warn!(wid = self.wid, "no picture encoding to fall back to");
            }
            return Vec::new();
        };
        match self.encode_picture(&item.frame, &encoding, item, item.options.quality, item.flush) {
            Ok(p) => {
                self.invalidate_scroll(&item.frame, item.options.quality);
                vec![p]
            }
            Err(e) => {
                self.log_failure(&e, &encoding);
                Vec::new()
            }
        }
    }

    fn encode_picture(
        &self,
        frame: &Frame,
        encoding: &str,
        item: &EncodeQueueItem,
        quality: u8,
        flush: u32,
    ) -> Result<DrawPacket, EncodeError> {
        let encoder: Arc<dyn PictureEncoder> = self
            .registry()
            .picture_encoder(encoding)
            .ok_or_else(|| EncodeError::Unsupported(encoding.to_string()))?;
        let c = &self.policy.compression;
        let params = PictureParams {
            quality,
            speed: item.options.speed,
            compressors: self.compressors.clone(),
            level: c.level,
            min_saving: c.min_saving,
        };
        let out = encoder.encode(frame, &params)?;
        let mut packet = DrawPacket::new(
            self.wid,
            frame.x,
            frame.y,
            frame.width,
            frame.height,
            encoder.encoding(),
            out.data,
        );
        packet.rowstride = out.rowstride;
        packet.options.extend(out.options);
        packet.set_option(keys::QUALITY, quality);
        if flush > 0 {
            packet.set_option(keys::FLUSH, flush);
        }
        packet.set_option(keys::DAMAGE_SEQUENCE, item.sequence);
        Ok(packet)
    }

    fn log_failure(&mut self, e: &EncodeError, codec: &str) {
        if self.logged.insert(format!("{}:{codec}", e.kind())) {
            tracing::warn!(wid = self.wid, codec, error = %e, "encode failed");
        } else {
            tracing::debug!(wid = self.wid, codec, error = %e, "encode failed");
        }
    }
}

/// Right and bottom strips cut off by the dimension masks.
fn edge_regions(w: u32, h: u32, mw: u32, mh: u32) -> Vec<(u32, u32, u32, u32)> {
    let mut out = Vec::new();
    if mw < w {
        out.push((mw, 0, w - mw, h));
    }
    if mh < h && mw > 0 {
        out.push((0, mh, mw, h - mh));
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::rgb::RgbEncoder;
    use crate::codecs::{CscFactory, EncoderFactory, EncoderOutput, EncoderSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        cleaned: AtomicUsize,
    }

    struct MockEncoder {
        size: (u32, u32),
        format: PixelFormat,
        hold: u32,
        pending: bool,
        frames: u64,
        closed: bool,
        counters: Arc<Counters>,
    }

    impl VideoEncoder for MockEncoder {
        fn compress(&mut self, frame: &Frame, _q: u8, _s: u8) -> Result<EncoderOutput, EncodeError> {
            assert_eq!((frame.width, frame.height), self.size);
            let n = self.frames;
            self.frames += 1;
            if self.hold > 0 {
                self.pending = true;
                return Ok(EncoderOutput {
                    data: None,
                    frame: n,
                    delayed: self.hold,
                    ..Default::default()
                });
            }
            Ok(EncoderOutput {
                data: Some(vec![0xAB; 16]),
                frame: n,
                ..Default::default()
            })
        }

        fn flush(&mut self, frame_no: u64) -> Result<EncoderOutput, EncodeError> {
            if !std::mem::take(&mut self.pending) {
                return Ok(EncoderOutput::default());
            }
            Ok(EncoderOutput {
                data: Some(vec![0xCD; 16]),
                frame: frame_no,
                delayed: 0,
                ..Default::default()
            })
        }

        fn delayed_frames(&self) -> u32 {
            if self.pending { self.hold } else { 0 }
        }

        fn encoding(&self) -> &str {
            "h264"
        }

        fn codec_type(&self) -> &str {
            "mock"
        }

        fn src_format(&self) -> PixelFormat {
            self.format
        }

        fn size(&self) -> (u32, u32) {
            self.size
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn clean(&mut self) {
            if !self.closed {
                self.closed = true;
                self.counters.cleaned.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct MockFactory {
        hold: u32,
        counters: Arc<Counters>,
    }

    impl EncoderFactory for MockFactory {
        fn create(&self, p: &EncoderParams) -> Result<Box<dyn VideoEncoder>, EncodeError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockEncoder {
                size: (p.width, p.height),
                format: p.src_format,
                hold: self.hold,
                pending: false,
                frames: 0,
                closed: false,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct FailingCsc;

    impl CscFactory for FailingCsc {
        fn create(
            &self,
            _src: (u32, u32, PixelFormat),
            _dst: (u32, u32, PixelFormat),
            _speed: u8,
        ) -> Result<Box<dyn ColorspaceConverter>, EncodeError> {
            Err(EncodeError::CodecInit {
                codec: "failing".into(),
                reason: "test".into(),
            })
        }
    }

    fn spec(input: PixelFormat, factory: Arc<dyn EncoderFactory>) -> EncoderSpec {
        EncoderSpec {
            codec_type: "mock".into(),
            encoding: "h264".into(),
            input_format: input,
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
            factory,
        }
    }

    fn encoder_with(input: PixelFormat, hold: u32) -> (WindowVideoEncoder, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mut reg = CodecRegistry::new();
        reg.add_picture_encoder(Arc::new(RgbEncoder));
        reg.add_encoder(spec(
            input,
            Arc::new(MockFactory {
                hold,
                counters: Arc::clone(&counters),
            }),
        ));
        let caps = Arc::new(ClientCapabilities {
            encodings: vec!["h264".into(), "rgb".into()],
            ..Default::default()
        });
        let policy = Arc::new(PipelinePolicy::default());
        (WindowVideoEncoder::new(1, policy, reg.for_client(&caps), caps), counters)
    }

    fn frame_with(w: u32, h: u32, row: impl Fn(u32) -> [u8; 4]) -> Frame {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            let px = row(y);
            for _ in 0..w {
                data.extend_from_slice(&px);
            }
        }
        Frame::packed(0, 0, w, h, PixelFormat::Bgrx, w * 4, data)
    }

    fn item(frame: Frame, encoding: &str, sequence: u64, gate: &Arc<SequenceGate>) -> EncodeQueueItem {
        let now = Instant::now();
        EncodeQueueItem {
            wid: 1,
            width: frame.width,
            height: frame.height,
            damage_time: now,
            enqueue_time: now,
            encoding: encoding.into(),
            sequence,
            options: EncodeOptions {
                quality: 50,
                speed: 50,
                batch_delay: 20,
                scroll: true,
                window_size: (frame.width, frame.height),
                ..Default::default()
            },
            frame,
            flush: 0,
            gate: Arc::clone(gate),
            av_due: None,
        }
    }

    fn solid(w: u32, h: u32) -> Frame {
        frame_with(w, h, |_| [10, 20, 30, 0xFF])
    }

    #[test]
    fn picture_encoding_bypasses_video() {
        let (mut enc, counters) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        let out = enc.encode(item(solid(64, 64), "rgb", 1, &gate), Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].encoding, "rgb");
        assert_eq!(out[0].damage_sequence(), Some(1));
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_items_produce_nothing() {
        let (mut enc, _) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        gate.cancel(5);
        assert!(enc.encode(item(solid(200, 150), "h264", 5, &gate), Instant::now()).is_empty());
    }

    #[test]
    fn direct_pipeline_encodes_video() {
        let (mut enc, counters) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        let out = enc.encode(item(solid(200, 150), "h264", 1, &gate), Instant::now());
        assert_eq!(out.len(), 1);
        let p = &out[0];
        assert_eq!(p.encoding, "h264");
        assert_eq!(p.int_option(keys::FRAME), Some(0));
        assert_eq!(p.str_option(keys::ENCODER), Some("mock"));
        assert_eq!(p.str_option(keys::CSC), Some("BGRX"));
        assert_eq!(p.flush(), 0);
        assert_eq!(enc.state(), EncoderState::PipelineReady);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_csc_falls_back_to_pictures() {
        let (mut enc, counters) = encoder_with(PixelFormat::Yuv420p, 0);
        let gate = Arc::new(SequenceGate::new());
        let now = Instant::now();
        let out = enc.encode(item(solid(200, 150), "h264", 1, &gate), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].encoding, "rgb");
        assert!(enc.pipeline().is_none());
        let out = enc.encode(item(solid(200, 150), "h264", 2, &gate), now);
        assert_eq!(out[0].encoding, "rgb");
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_csc_tries_next_then_falls_back() {
        let counters = Arc::new(Counters::default());
        let mut reg = CodecRegistry::with_defaults();
        reg.add_csc(crate::codecs::CscSpec {
            name: "failing".into(),
            input_format: PixelFormat::Bgrx,
            output_format: PixelFormat::Yuv420p,
            min_width: 2,
            min_height: 2,
            max_width: 4096,
            max_height: 4096,
            width_mask: !1,
            height_mask: !1,
            can_scale: false,
            quality: 100,
            speed: 100,
            setup_cost: 0,
            cpu_cost: 0,
            gpu_cost: 0,
            factory: Arc::new(FailingCsc),
        });
        reg.add_encoder(spec(
            PixelFormat::Yuv420p,
            Arc::new(MockFactory {
                hold: 0,
                counters: Arc::clone(&counters),
            }),
        ));
        let caps = Arc::new(ClientCapabilities {
            encodings: vec!["h264".into(), "rgb".into()],
            ..Default::default()
        });
        let mut enc = WindowVideoEncoder::new(1, Arc::new(PipelinePolicy::default()), reg.for_client(&caps), caps);
        let gate = Arc::new(SequenceGate::new());
        let out = enc.encode(item(solid(200, 150), "h264", 1, &gate), Instant::now());
        // the soft converter is tried after the failing one
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].encoding, "h264");
        assert_eq!(out[0].str_option(keys::CSC), Some("YUV420P"));
    }

    #[test]
    fn masked_edges_are_sent_as_pictures() {
        let (mut enc, _) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        let out = enc.encode(item(solid(201, 151), "h264", 1, &gate), Instant::now());
        assert_eq!(out.len(), 3);
        assert_eq!((out[0].encoding.as_str(), out[0].w, out[0].h, out[0].flush()), ("h264", 200, 150, 2));
        assert_eq!((out[1].x, out[1].y, out[1].w, out[1].h, out[1].flush()), (200, 0, 1, 151, 1));
        assert_eq!((out[2].x, out[2].y, out[2].w, out[2].h, out[2].flush()), (0, 150, 200, 1, 0));
    }

    #[test]
    fn buffered_first_frame_sends_fallback_and_flushes_once() {
        let (mut enc, _) = encoder_with(PixelFormat::Bgrx, 2);
        let gate = Arc::new(SequenceGate::new());
        let now = Instant::now();
        let out = enc.encode(item(solid(200, 150), "h264", 1, &gate), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].encoding, "rgb");
        assert!(enc.flush_pending());
        assert_eq!(enc.state(), EncoderState::FlushPending);
        assert_eq!(enc.next_deadline(), Some(now + Duration::from_millis(200)));

        let first = enc.do_flush_video_encoder(now);
        let second = enc.do_flush_video_encoder(now);
        assert_eq!(first.len() + second.len(), 1);
        assert!(first[0].bool_option(keys::FLUSH_ENCODER));
        assert!(!enc.flush_pending());
        assert!(enc.poll_timers(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn new_damage_replaces_pending_flush() {
        let (mut enc, _) = encoder_with(PixelFormat::Bgrx, 1);
        let gate = Arc::new(SequenceGate::new());
        let now = Instant::now();
        enc.encode(item(solid(200, 150), "h264", 1, &gate), now);
        assert!(enc.flush_pending());

        // pictures leave the buffered frames alone
        enc.encode(item(solid(64, 64), "rgb", 2, &gate), now);
        assert!(enc.flush_pending());

        let later = now + Duration::from_millis(100);
        let out = enc.encode(item(solid(200, 150), "h264", 3, &gate), later);
        assert!(out.is_empty());
        assert_eq!(enc.next_deadline(), Some(later + Duration::from_millis(200)));
        assert!(enc.poll_timers(now + Duration::from_millis(250)).is_empty());
        let flushed = enc.poll_timers(later + Duration::from_millis(200));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].damage_sequence(), Some(3));
    }

    #[test]
    fn resize_rebuilds_pipeline() {
        let (mut enc, counters) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        let now = Instant::now();
        enc.encode(item(solid(200, 150), "h264", 1, &gate), now);
        let encodings = vec!["h264".to_string()];
        assert!(enc.do_check_pipeline(&encodings, 200, 150, PixelFormat::Bgrx));
        assert!(enc.do_check_pipeline(&encodings, 201, 151, PixelFormat::Bgrx));
        assert!(!enc.do_check_pipeline(&encodings, 400, 300, PixelFormat::Bgrx));
        assert!(!enc.do_check_pipeline(&["vp8".to_string()], 200, 150, PixelFormat::Bgrx));

        let out = enc.encode(item(solid(400, 300), "h264", 2, &gate), now);
        assert_eq!((out[0].w, out[0].h), (400, 300));
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_pipeline_is_cleaned() {
        let (mut enc, counters) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        let now = Instant::now();
        enc.encode(item(solid(200, 150), "h264", 1, &gate), now);
        enc.poll_timers(now + Duration::from_secs(9));
        assert!(enc.pipeline().is_some());
        enc.poll_timers(now + Duration::from_secs(11));
        assert!(enc.pipeline().is_none());
        assert_eq!(enc.state(), EncoderState::Idle);
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suspend_then_rebuild() {
        let (mut enc, counters) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        let now = Instant::now();
        enc.encode(item(solid(200, 150), "h264", 1, &gate), now);
        enc.suspend();
        assert_eq!(enc.state(), EncoderState::Suspended);
        let out = enc.encode(item(solid(200, 150), "h264", 2, &gate), now);
        assert_eq!(out[0].encoding, "h264");
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn vertical_shift_becomes_scroll_packet() {
        let (mut enc, _) = encoder_with(PixelFormat::Bgrx, 0);
        let gate = Arc::new(SequenceGate::new());
        let now = Instant::now();
        let row = |r: u32| [r as u8, (r >> 8) as u8, 0x55, 0xFF];
        let first = enc.encode(item(frame_with(800, 600, row), "h264", 1, &gate), now);
        assert_eq!(first[0].encoding, "h264");

        let shifted = frame_with(800, 600, |r| if r < 20 { [0xAA, r as u8, 0x11, 0xFF] } else { row(r - 20) });
        let out = enc.encode(item(shifted, "h264", 2, &gate), now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].encoding, "scroll");
        assert_eq!(out[0].data, DrawData::Scroll(vec![ScrollRect::new(0, 0, 800, 580, 0, 20)]));
        assert_eq!(out[0].flush(), 1);
        assert_eq!((out[1].encoding.as_str(), out[1].y, out[1].h, out[1].flush()), ("rgb", 0, 20, 0));
    }
}
