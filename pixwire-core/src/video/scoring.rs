//! Video pipeline scoring.
//!
//! Enumerates every `(csc?, encoder)` combination able to turn a
//! `src_format` frame into one of the requested encodings and ranks them.
//! Scores are distances: the lowest score is the best option.
//!
//! ```text
//!   src_format ──────────────────────────────▶ encoder(src_format)     direct
//!   src_format ──▶ csc(src_format → fmt) ────▶ encoder(fmt)            indirect
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codecs::{CodecRegistry, CscSpec, EncoderSpec};
use crate::image::PixelFormat;
use crate::policy::PipelinePolicy;

// ── Types ────────────────────────────────────────────────────────

/// One scored pipeline candidate.
#[derive(Debug, Clone)]
pub struct PipelineOption {
    /// Distance from the targets; lower is better.
    pub score: f64,
    /// Overall scaling applied.
    pub scaling: (u32, u32),
    /// Scaling done by the converter.
    pub csc_scaling: (u32, u32),
    /// Converter input size.
    pub csc_width: u32,
    pub csc_height: u32,
    pub csc: Option<Arc<CscSpec>>,
    /// Encoder input format (converter output format when there is one).
    pub encoder_format: PixelFormat,
    /// Scaling done by the encoder.
    pub encoder_scaling: (u32, u32),
    /// Encoder input size.
    pub encoder_width: u32,
    pub encoder_height: u32,
    pub encoder: Arc<EncoderSpec>,
}

impl PipelineOption {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match &self.csc {
            Some(csc) => format!(
                "{}({}→{}) + {}:{} {}x{}",
                csc.name,
                csc.input_format,
                csc.output_format,
                self.encoder.codec_type,
                self.encoder.encoding,
                self.encoder_width,
                self.encoder_height
            ),
            None => format!(
                "{}:{}({}) {}x{}",
                self.encoder.codec_type, self.encoder.encoding, self.encoder_format, self.encoder_width, self.encoder_height
            ),
        }
    }
}

/// Identity of the active pipeline, for the stability bonus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineIdentity {
    /// Converter name and output format.
    pub csc: Option<(String, PixelFormat)>,
    /// Encoder backend, encoding and input format.
    pub encoder: (String, String, PixelFormat),
}

impl PipelineIdentity {
    pub fn of(option: &PipelineOption) -> Self {
        Self {
            csc: option.csc.as_ref().map(|c| (c.name.clone(), c.output_format)),
            encoder: (
                option.encoder.codec_type.clone(),
                option.encoder.encoding.clone(),
                option.encoder_format,
            ),
        }
    }

    fn matches(&self, csc: Option<&CscSpec>, encoder: &EncoderSpec, format: PixelFormat) -> bool {
        let csc_id = csc.map(|c| (c.name.clone(), c.output_format));
        self.csc == csc_id
            && self.encoder.0 == encoder.codec_type
            && self.encoder.1 == encoder.encoding
            && self.encoder.2 == format
    }
}

/// Everything the scorer needs to know about the frame and targets.
#[derive(Debug, Clone)]
pub struct ScoreRequest {
    /// Candidate encodings, in preference order.
    pub encodings: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub src_format: PixelFormat,
    pub target_quality: u8,
    pub min_quality: u8,
    pub target_speed: u8,
    pub min_speed: u8,
    /// Active pipeline, if any.
    pub current: Option<PipelineIdentity>,
    pub fps: u32,
    /// The frame matches the detected video region.
    pub in_video_region: bool,
    /// The region is confirmed video.
    pub is_video: bool,
    /// Region detection is still in progress.
    pub detecting: bool,
    /// Content is known to be text.
    pub is_text: bool,
}

#[derive(Debug, Clone)]
struct ScoreCache {
    key: (Vec<String>, u32, u32, PixelFormat, Option<PipelineIdentity>),
    inputs: (u8, u8, u32),
    at: Instant,
    options: Vec<PipelineOption>,
}

// ── PipelineScorer ───────────────────────────────────────────────

/// Scores pipeline options for one window.
pub struct PipelineScorer {
    policy: Arc<PipelinePolicy>,
    registry: CodecRegistry,
    cache: Option<ScoreCache>,
}

impl PipelineScorer {
    pub fn new(policy: Arc<PipelinePolicy>, registry: CodecRegistry) -> Self {
        Self {
            policy,
            registry,
            cache: None,
        }
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    /// Drop cached scores.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Adjust the quality target for video and non-video regions.
    pub fn tune_quality(req: &ScoreRequest) -> u8 {
        let (tq, min_q) = (req.target_quality, req.min_quality);
        if !req.in_video_region || tq >= 100 {
            return tq;
        }
        if req.is_video {
            let f = (2 * req.fps).min(90);
            (tq as u32 * (100 - f) / 100).max(min_q as u32) as u8
        } else {
            ((tq as f64 / 100.0).sqrt() * 100.0) as u8
        }
    }

    /// All options for `req`, best first.
    ///
    /// `scaling(max_w, max_h)` is asked once per distinct limit pair.
    /// Cached scores are reused only for the same active pipeline.
    pub fn score_options(
        &mut self,
        req: &ScoreRequest,
        scaling: &mut dyn FnMut(u32, u32) -> (u32, u32),
        now: Instant,
    ) -> Vec<PipelineOption> {
        let key = (
            req.encodings.clone(),
            req.width,
            req.height,
            req.src_format,
            req.current.clone(),
        );
        let inputs = (req.target_quality, req.target_speed, req.fps);
        if let Some(cache) = &self.cache {
            if cache.key == key {
                let age = now.saturating_duration_since(cache.at);
                let sp = &self.policy.scoring;
                let fresh = age < Duration::from_millis(sp.cache_ms)
                    || (cache.inputs == inputs && age < Duration::from_millis(sp.idle_cache_ms));
                if fresh {
                    tracing::trace!(age_ms = age.as_millis() as u64, "using cached pipeline scores");
                    return cache.options.clone();
                }
            }
        }

        let options = self.compute(req, scaling);
        tracing::debug!(
            width = req.width,
            height = req.height,
            src = %req.src_format,
            count = options.len(),
            best = options.first().map(|o| o.describe()).unwrap_or_default(),
            "scored pipeline options"
        );
        self.cache = Some(ScoreCache {
            key,
            inputs,
            at: now,
            options: options.clone(),
        });
        options
    }

    fn compute(&self, req: &ScoreRequest, scaling: &mut dyn FnMut(u32, u32) -> (u32, u32)) -> Vec<PipelineOption> {
        let target_q = Self::tune_quality(req);
        let mut scaling_cache: HashMap<(u32, u32), (u32, u32)> = HashMap::new();
        let mut scale = |max_w: u32, max_h: u32| *scaling_cache.entry((max_w, max_h)).or_insert_with(|| scaling(max_w, max_h));

        let mut out = Vec::new();
        let n = req.encodings.len() as i64;
        for (index, encoding) in req.encodings.iter().enumerate() {
            let bias = index as i64 - n / 2;
            let by_input = self.registry.encoder_specs(encoding);
            if by_input.is_empty() {
                tracing::trace!(encoding = %encoding, "no encoder specs");
                continue;
            }
            if let Some(encoders) = by_input.get(&req.src_format) {
                for enc in encoders {
                    if let Some(o) = self.score_one(req, target_q, bias, None, enc, req.src_format, &mut scale) {
                        out.push(o);
                    }
                }
            }
            for (out_format, cscs) in self.registry.csc_specs(req.src_format) {
                let Some(encoders) = by_input.get(&out_format) else {
                    continue;
                };
                for csc in &cscs {
                    for enc in encoders {
                        if let Some(o) = self.score_one(req, target_q, bias, Some(csc), enc, out_format, &mut scale) {
                            out.push(o);
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| a.score.total_cmp(&b.score));
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn score_one(
        &self,
        req: &ScoreRequest,
        target_q: u8,
        bias: i64,
        csc: Option<&Arc<CscSpec>>,
        enc: &Arc<EncoderSpec>,
        enc_format: PixelFormat,
        scale: &mut dyn FnMut(u32, u32) -> (u32, u32),
    ) -> Option<PipelineOption> {
        let (w, h) = (req.width, req.height);
        let (mut max_w, mut max_h) = (enc.max_width, enc.max_height);
        let (mut mask_w, mut mask_h) = (enc.width_mask, enc.height_mask);
        if let Some(c) = csc {
            max_w = max_w.min(c.max_width);
            max_h = max_h.min(c.max_height);
            mask_w &= c.width_mask;
            mask_h &= c.height_mask;
        }
        let csc_scales = csc.is_some_and(|c| c.can_scale);
        let can_scale = csc_scales || enc.can_scale;
        let scaling = if can_scale { scale(max_w, max_h) } else { (1, 1) };
        if !can_scale && (w > max_w || h > max_h) {
            return None;
        }

        let (csc_w, csc_h) = (w & mask_w, h & mask_h);
        let (n, d) = scaling;
        let enc_w = ((csc_w as u64 * n as u64 / d as u64) as u32) & mask_w;
        let enc_h = ((csc_h as u64 * n as u64 / d as u64) as u32) & mask_h;
        if enc_w == 0 || enc_h == 0 || !enc.accepts_size(enc_w, enc_h) {
            return None;
        }
        if let Some(c) = csc {
            if !c.accepts_size(csc_w, csc_h) {
                return None;
            }
        }
        let (csc_scaling, encoder_scaling) = match (scaling == (1, 1), csc_scales) {
            (true, _) => ((1, 1), (1, 1)),
            (false, true) => (scaling, (1, 1)),
            (false, false) => ((1, 1), scaling),
        };

        let score = self.distance(req, target_q, bias, csc.map(|c| c.as_ref()), enc, enc_format, scaling);
        Some(PipelineOption {
            score,
            scaling,
            csc_scaling,
            csc_width: csc_w,
            csc_height: csc_h,
            csc: csc.cloned(),
            encoder_format: enc_format,
            encoder_scaling,
            encoder_width: enc_w,
            encoder_height: enc_h,
            encoder: Arc::clone(enc),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn distance(
        &self,
        req: &ScoreRequest,
        target_q: u8,
        bias: i64,
        csc: Option<&CscSpec>,
        enc: &EncoderSpec,
        enc_format: PixelFormat,
        scaling: (u32, u32),
    ) -> f64 {
        let w = &self.policy.scoring;
        let quality = enc.quality.min(csc.map(|c| c.quality).unwrap_or(100)) as f64;
        let speed = enc.speed.min(csc.map(|c| c.speed).unwrap_or(100)) as f64;

        let mut score = w.quality_weight * (target_q as f64 - quality).abs()
            + w.speed_weight * (req.target_speed as f64 - speed).abs();
        if quality < req.min_quality as f64 || speed < req.min_speed as f64 {
            score += w.below_min_penalty;
        }
        let lossy_csc = csc.is_some() && enc_format.is_subsampled();
        if req.target_quality >= 100 && (scaling != (1, 1) || lossy_csc) {
            score += w.lossless_penalty;
        }
        if req.is_text && enc_format.is_subsampled() {
            score += w.text_penalty;
        }
        let stable = req
            .current
            .as_ref()
            .is_some_and(|id| id.matches(csc, enc, enc_format));
        if stable {
            score -= w.stability_bonus;
        } else {
            let setup = enc.setup_cost + csc.map(|c| c.setup_cost).unwrap_or(0);
            score += w.setup_cost_weight * setup as f64;
        }
        score += w.order_bias_weight * bias as f64;

        let cpu = enc.cpu_cost + csc.map(|c| c.cpu_cost).unwrap_or(0);
        let gpu = enc.gpu_cost + csc.map(|c| c.gpu_cost).unwrap_or(0);
        let steady_video = req.is_video && !req.detecting;
        let cost = if steady_video && enc.gpu_cost > 0 && gpu < cpu { gpu } else { cpu };
        score + w.cost_weight * cost as f64
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::{EncoderFactory, EncoderParams, VideoEncoder};
    use crate::error::EncodeError;

    struct NullFactory;

    impl EncoderFactory for NullFactory {
        fn create(&self, _: &EncoderParams) -> Result<Box<dyn VideoEncoder>, EncodeError> {
            Err(EncodeError::Unsupported("null".into()))
        }
    }

    fn encoder(codec: &str, encoding: &str, input: PixelFormat, quality: u8, can_scale: bool) -> EncoderSpec {
        EncoderSpec {
            codec_type: codec.into(),
            encoding: encoding.into(),
            input_format: input,
            output_formats: vec![input],
            min_width: 16,
            min_height: 16,
            max_width: 4096,
            max_height: 2048,
            width_mask: !1,
            height_mask: !1,
            can_scale,
            has_lossless_mode: false,
            quality,
            speed: 50,
            setup_cost: 50,
            cpu_cost: 100,
            gpu_cost: 0,
            factory: Arc::new(NullFactory),
        }
    }

    fn request(encodings: &[&str], w: u32, h: u32) -> ScoreRequest {
        ScoreRequest {
            encodings: encodings.iter().map(|s| s.to_string()).collect(),
            width: w,
            height: h,
            src_format: PixelFormat::Bgrx,
            target_quality: 50,
            min_quality: 0,
            target_speed: 50,
            min_speed: 0,
            current: None,
            fps: 0,
            in_video_region: false,
            is_video: false,
            detecting: false,
            is_text: false,
        }
    }

    fn scorer(reg: CodecRegistry) -> PipelineScorer {
        PipelineScorer::new(Arc::new(PipelinePolicy::default()), reg)
    }

    #[test]
    fn no_csc_no_options() {
        let mut reg = CodecRegistry::new();
        reg.add_encoder(encoder("x", "h264", PixelFormat::Yuv420p, 50, false));
        let mut s = scorer(reg);
        let opts = s.score_options(&request(&["h264"], 640, 480), &mut |_, _| (1, 1), Instant::now());
        assert!(opts.is_empty());
    }

    #[test]
    fn options_match_encoder_input() {
        let mut reg = CodecRegistry::with_defaults();
        reg.add_encoder(encoder("x", "h264", PixelFormat::Yuv420p, 50, false));
        reg.add_encoder(encoder("y", "h264", PixelFormat::Yuv444p, 90, false));
        reg.add_encoder(encoder("z", "h264", PixelFormat::Bgrx, 70, false));
        let mut s = scorer(reg);
        let opts = s.score_options(&request(&["h264"], 641, 481), &mut |_, _| (1, 1), Instant::now());
        assert_eq!(opts.len(), 3);
        for o in &opts {
            assert_eq!(o.encoder.input_format, o.encoder_format);
            if let Some(c) = &o.csc {
                assert_eq!(c.output_format, o.encoder_format);
            }
            assert_eq!((o.encoder_width, o.encoder_height), (640, 480));
        }
        assert!(opts.windows(2).all(|p| p[0].score <= p[1].score));
    }

    #[test]
    fn oversized_frames_skip_non_scaling_options() {
        let mut reg = CodecRegistry::new();
        reg.add_encoder(encoder("fixed", "h264", PixelFormat::Bgrx, 50, false));
        reg.add_encoder(encoder("scaler", "h264", PixelFormat::Bgrx, 50, true));
        let mut s = scorer(reg);
        let mut calls = 0;
        let opts = s.score_options(
            &request(&["h264"], 3840, 2160),
            &mut |_, _| {
                calls += 1;
                (1, 2)
            },
            Instant::now(),
        );
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].encoder.codec_type, "scaler");
        assert_eq!(opts[0].encoder_scaling, (1, 2));
        assert_eq!((opts[0].encoder_width, opts[0].encoder_height), (1920, 1080));
        assert_eq!(calls, 1);
    }

    #[test]
    fn stability_bonus_favours_current() {
        let mut reg = CodecRegistry::new();
        reg.add_encoder(encoder("a", "h264", PixelFormat::Bgrx, 50, false));
        reg.add_encoder(encoder("b", "h264", PixelFormat::Bgrx, 50, false));
        let mut s = scorer(reg);
        let mut req = request(&["h264"], 640, 480);
        req.current = Some(PipelineIdentity {
            csc: None,
            encoder: ("b".into(), "h264".into(), PixelFormat::Bgrx),
        });
        let opts = s.score_options(&req, &mut |_, _| (1, 1), Instant::now());
        assert_eq!(opts[0].encoder.codec_type, "b");
    }

    #[test]
    fn cache_expires_unless_idle() {
        let mut reg = CodecRegistry::new();
        reg.add_encoder(encoder("a", "h264", PixelFormat::Bgrx, 50, true));
        let mut s = scorer(reg);
        let t0 = Instant::now();
        let req = request(&["h264"], 640, 480);
        let mut calls = 0;
        let mut count = |_: u32, _: u32| {
            calls += 1;
            (1, 1)
        };
        s.score_options(&req, &mut count, t0);
        s.score_options(&req, &mut count, t0 + Duration::from_millis(500));
        s.score_options(&req, &mut count, t0 + Duration::from_secs(30));
        let mut changed = req.clone();
        changed.target_speed = 90;
        s.score_options(&changed, &mut count, t0 + Duration::from_secs(31));
        assert_eq!(calls, 2);
    }

    #[test]
    fn cache_follows_active_pipeline() {
        let mut reg = CodecRegistry::new();
        reg.add_encoder(encoder("a", "h264", PixelFormat::Bgrx, 50, false));
        reg.add_encoder(encoder("b", "h264", PixelFormat::Bgrx, 50, false));
        let mut s = scorer(reg);
        let now = Instant::now();
        let mut req = request(&["h264"], 640, 480);
        req.current = Some(PipelineIdentity {
            csc: None,
            encoder: ("a".into(), "h264".into(), PixelFormat::Bgrx),
        });
        let opts = s.score_options(&req, &mut |_, _| (1, 1), now);
        assert_eq!(opts[0].encoder.codec_type, "a");

        req.current = Some(PipelineIdentity {
            csc: None,
            encoder: ("b".into(), "h264".into(), PixelFormat::Bgrx),
        });
        let opts = s.score_options(&req, &mut |_, _| (1, 1), now + Duration::from_millis(10));
        assert_eq!(opts[0].encoder.codec_type, "b");
    }

    #[test]
    fn mixed_limits_scale_independently_during_resize_hold() {
        use crate::video::scaling::{ScalingContext, ScalingDecider};

        let mut reg = CodecRegistry::new();
        let mut small = encoder("small", "h264", PixelFormat::Bgrx, 50, true);
        (small.max_width, small.max_height) = (1024, 1024);
        let mut large = encoder("large", "h264", PixelFormat::Bgrx, 50, true);
        (large.max_width, large.max_height) = (4096, 4096);
        reg.add_encoder(small);
        reg.add_encoder(large);
        let mut s = scorer(reg);

        let mut decider = ScalingDecider::new(Arc::new(PipelinePolicy::default()));
        let ctx = ScalingContext {
            quality: 30,
            speed: 80,
            fps: 30,
            is_video: true,
            damage_events: 500,
            since_resize: Some(Duration::from_millis(100)),
            video_scaling: true,
            ..Default::default()
        };
        let now = Instant::now();
        let mut scale = |mw: u32, mh: u32| decider.calculate_scaling(2000, 2000, mw, mh, &ctx, now);
        let opts = s.score_options(&request(&["h264"], 2000, 2000), &mut scale, now);

        let by_codec = |name: &str| opts.iter().find(|o| o.encoder.codec_type == name).map(|o| o.scaling);
        assert_eq!(by_codec("small"), Some((1, 2)));
        assert_eq!(by_codec("large"), Some((1, 1)));
        assert_eq!(decider.current(), (1, 1));
    }

    #[test]
    fn quality_tuning() {
        let mut req = request(&["h264"], 640, 480);
        req.target_quality = 80;
        assert_eq!(PipelineScorer::tune_quality(&req), 80);
        req.in_video_region = true;
        assert_eq!(PipelineScorer::tune_quality(&req), 89);
        req.is_video = true;
        req.fps = 25;
        req.min_quality = 30;
        assert_eq!(PipelineScorer::tune_quality(&req), 40);
    }

    #[test]
    fn lossless_target_penalises_subsampling() {
        let mut reg = CodecRegistry::with_defaults();
        reg.add_encoder(encoder("x", "h264", PixelFormat::Yuv420p, 100, false));
        reg.add_encoder(encoder("y", "h264", PixelFormat::Yuv444p, 100, false));
        let mut s = scorer(reg);
        let mut req = request(&["h264"], 640, 480);
        req.target_quality = 100;
        let opts = s.score_options(&req, &mut |_, _| (1, 1), Instant::now());
        assert_eq!(opts[0].encoder_format, PixelFormat::Yuv444p);
    }
}
