//! Video downscaling heuristic.
//!
//! Picks a `(num, den)` ratio for the next video frames. The ratio never
//! upscales, never goes below 1/10, and always fits the encoder limits and
//! the client render size.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::policy::PipelinePolicy;

/// Ratios the heuristic chooses from, smallest first.
pub const SCALING_OPTIONS: [(u32, u32); 7] = [(1, 10), (1, 5), (1, 4), (1, 3), (1, 2), (2, 3), (1, 1)];

const NO_SCALING: (u32, u32) = (1, 1);
const MIN_SCALING: (u32, u32) = (1, 10);
const RESIZE_HOLD: Duration = Duration::from_millis(500);
const SCROLL_HOLD: Duration = Duration::from_secs(5);
const MIN_DAMAGE_EVENTS: u64 = 50;
const LARGE_FRAME: u64 = 1920 * 1080;

/// Compare two ratios.
pub fn cmp_ratio(a: (u32, u32), b: (u32, u32)) -> Ordering {
    (a.0 as u64 * b.1 as u64).cmp(&(b.0 as u64 * a.1 as u64))
}

fn ratio_f(r: (u32, u32)) -> f64 {
    r.0 as f64 / r.1 as f64
}

/// The stronger downscale of two ratios.
fn min_ratio(a: (u32, u32), b: (u32, u32)) -> (u32, u32) {
    if cmp_ratio(a, b) == Ordering::Greater { b } else { a }
}

/// Inputs describing the window at decision time.
#[derive(Debug, Clone, Default)]
pub struct ScalingContext {
    pub quality: u8,
    pub speed: u8,
    /// Frames per second of the damage stream.
    pub fps: u32,
    /// The frames belong to a confirmed video region.
    pub is_video: bool,
    /// Content is known to be text.
    pub is_text: bool,
    pub fullscreen: bool,
    pub maximized: bool,
    pub damage_events: u64,
    pub since_resize: Option<Duration>,
    pub since_scroll: Option<Duration>,
    /// Bits per second, 0 = unlimited.
    pub bandwidth_limit: u64,
    /// Client render size limit.
    pub render_size: Option<(u32, u32)>,
    /// Client accepts scaled video.
    pub video_scaling: bool,
}

/// Stateful scaling decision for one window.
#[derive(Debug, Clone)]
pub struct ScalingDecider {
    policy: Arc<PipelinePolicy>,
    current: (u32, u32),
    last_change: Option<Instant>,
    warned: bool,
}

impl ScalingDecider {
    pub fn new(policy: Arc<PipelinePolicy>) -> Self {
        Self {
            policy,
            current: NO_SCALING,
            last_change: None,
            warned: false,
        }
    }

    /// Ratio of the installed pipeline.
    pub fn current(&self) -> (u32, u32) {
        self.current
    }

    /// Record the ratio of a newly installed pipeline.
    pub fn commit(&mut self, ratio: (u32, u32), now: Instant) {
        if ratio != self.current {
            tracing::debug!(from = ?self.current, to = ?ratio, "scaling changed");
            self.current = ratio;
            self.last_change = Some(now);
        }
    }

    /// Forget the current ratio (after a resize).
    pub fn reset(&mut self) {
        self.current = NO_SCALING;
        self.last_change = None;
    }

    /// Largest ratio at which `width x height` fits all limits.
    pub fn min_required(width: u32, height: u32, max_w: u32, max_h: u32, render: Option<(u32, u32)>) -> (u32, u32) {
        let (lim_w, lim_h) = match render {
            Some((rw, rh)) => (max_w.min(rw.max(1)), max_h.min(rh.max(1))),
            None => (max_w, max_h),
        };
        SCALING_OPTIONS
            .iter()
            .rev()
            .copied()
            .find(|&(n, d)| width as u64 * n as u64 <= lim_w as u64 * d as u64 && height as u64 * n as u64 <= lim_h as u64 * d as u64)
            .unwrap_or(MIN_SCALING)
    }

    /// Choose the scaling ratio for a `width x height` frame.
    ///
    /// Only reads the installed ratio; see [`commit`](Self::commit).
    pub fn calculate_scaling(
        &mut self,
        width: u32,
        height: u32,
        max_w: u32,
        max_h: u32,
        ctx: &ScalingContext,
        now: Instant,
    ) -> (u32, u32) {
        if width == 0 || height == 0 {
            return NO_SCALING;
        }
        let min_required = Self::min_required(width, height, max_w, max_h, ctx.render_size);
        let chosen = self.decide(width, height, min_required, ctx, now);
        let bounded = min_ratio(chosen, min_required);
        if cmp_ratio(bounded, MIN_SCALING) == Ordering::Less {
            MIN_SCALING
        } else if cmp_ratio(bounded, NO_SCALING) == Ordering::Greater {
            NO_SCALING
        } else {
            bounded
        }
    }

    fn decide(&mut self, width: u32, height: u32, min_required: (u32, u32), ctx: &ScalingContext, now: Instant) -> (u32, u32) {
        let sp = &self.policy.scaling;
        if !sp.enabled || !ctx.video_scaling {
            if min_required != NO_SCALING {
                if !self.warned {
                    tracing::warn!(width, height, "frame exceeds encoder limits, scaling despite scaling being disabled");
                    self.warned = true;
                }
                return min_required;
            }
            return NO_SCALING;
        }
        if let Some(hard) = sp.hardcoded {
            return min_ratio(hard, min_required);
        }
        if sp.control == Some(0) {
            return min_required;
        }
        let recent = |d: Option<Duration>, hold: Duration| d.is_some_and(|d| d < hold);
        if recent(ctx.since_resize, RESIZE_HOLD) || recent(ctx.since_scroll, SCROLL_HOLD) {
            return min_ratio(self.current, min_required);
        }
        if ctx.damage_events <= MIN_DAMAGE_EVENTS || ctx.is_text {
            return min_required;
        }
        match sp.control {
            None => self.auto_scaling(width, height, min_required, ctx, now),
            Some(_) => {
                let q = ctx.quality;
                if ctx.fullscreen && q < 60 {
                    (1, 3)
                } else if ctx.maximized && q < 60 {
                    (1, 2)
                } else if width as u64 * height as u64 > LARGE_FRAME && ctx.speed > q {
                    (1, 2)
                } else {
                    min_required
                }
            }
        }
    }

    fn auto_scaling(&self, width: u32, height: u32, min_required: (u32, u32), ctx: &ScalingContext, now: Instant) -> (u32, u32) {
        let sp = &self.policy.scaling;
        let q_noscaling = if ctx.is_video { sp.q_noscaling_video } else { sp.q_noscaling };
        if ctx.quality >= q_noscaling || ctx.fps == 0 {
            return min_required;
        }
        let pps = ctx.fps as f64 * width as f64 * height as f64;
        let mut target = if ctx.bandwidth_limit > 0 {
            (sp.min_pps as f64).max(ctx.bandwidth_limit as f64 / 8.0 * 20.0)
        } else {
            sp.pps_target as f64
        };
        if ctx.is_text {
            target *= 4.0;
        }
        if !ctx.is_video {
            target *= 2.0;
        }
        let q = ctx.quality as f64 - if ctx.is_video { 30.0 } else { 0.0 };
        target = target * (100.0 + q.max(0.0)).powi(2) / 200.0f64.powi(2);
        target = target * 60.0f64.powi(2) / (ctx.speed as f64 + 20.0).powi(2);

        let elapsed = self
            .last_change
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(f64::INFINITY);
        let gain = 1.0 + 3.0 * (-elapsed / 3.0).exp();

        let mut best = min_required;
        let mut best_score = f64::INFINITY;
        for option in SCALING_OPTIONS {
            let r = ratio_f(option);
            let spps = pps * r * r;
            let mut score = (1.0 - target / spps).abs() * 100.0;
            if option == self.current {
                score /= gain;
            }
            if cmp_ratio(option, min_required) == Ordering::Greater {
                score *= 100.0;
            }
            tracing::trace!(?option, score, "scaling option");
            if score < best_score {
                best_score = score;
                best = option;
            }
        }
        best
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decider() -> ScalingDecider {
        ScalingDecider::new(Arc::new(PipelinePolicy::default()))
    }

    fn busy_ctx() -> ScalingContext {
        ScalingContext {
            quality: 30,
            speed: 80,
            fps: 30,
            is_video: true,
            damage_events: 500,
            video_scaling: true,
            ..Default::default()
        }
    }

    #[test]
    fn zero_size_and_small_frames() {
        let mut d = decider();
        let now = Instant::now();
        assert_eq!(d.calculate_scaling(0, 100, 4096, 4096, &busy_ctx(), now), (1, 1));
        let idle = ScalingContext {
            video_scaling: true,
            ..Default::default()
        };
        assert_eq!(d.calculate_scaling(640, 480, 4096, 4096, &idle, now), (1, 1));
    }

    #[test]
    fn min_required_respects_limits() {
        assert_eq!(ScalingDecider::min_required(1000, 1000, 4096, 4096, None), (1, 1));
        assert_eq!(ScalingDecider::min_required(4000, 3000, 2048, 2048, None), (1, 2));
        assert_eq!(ScalingDecider::min_required(3000, 3000, 4096, 4096, Some((2000, 2000))), (2, 3));
        assert_eq!(ScalingDecider::min_required(100_000, 10, 100, 100, None), (1, 10));
    }

    #[test]
    fn never_upscales_nor_exceeds_max() {
        let mut d = decider();
        let now = Instant::now();
        for (w, h, mw, mh) in [(3840, 2160, 1920, 1080), (800, 600, 4096, 4096), (8000, 100, 4096, 4096)] {
            let (n, den) = d.calculate_scaling(w, h, mw, mh, &busy_ctx(), now);
            assert!(n <= den);
            assert!(w as u64 * n as u64 <= mw as u64 * den as u64);
            assert!(h as u64 * n as u64 <= mh as u64 * den as u64);
        }
    }

    #[test]
    fn disabled_scaling_still_fits() {
        let mut policy = PipelinePolicy::default();
        policy.scaling.enabled = false;
        let mut d = ScalingDecider::new(Arc::new(policy));
        let now = Instant::now();
        assert_eq!(d.calculate_scaling(1920, 1080, 4096, 4096, &busy_ctx(), now), (1, 1));
        assert_eq!(d.calculate_scaling(8192, 4096, 4096, 4096, &busy_ctx(), now), (1, 2));
    }

    #[test]
    fn hardcoded_takes_stronger_downscale() {
        let mut policy = PipelinePolicy::default();
        policy.scaling.hardcoded = Some((2, 3));
        let mut d = ScalingDecider::new(Arc::new(policy));
        let now = Instant::now();
        assert_eq!(d.calculate_scaling(1000, 1000, 4096, 4096, &busy_ctx(), now), (2, 3));
        assert_eq!(d.calculate_scaling(8000, 1000, 4096, 4096, &busy_ctx(), now), (1, 2));
    }

    #[test]
    fn high_quality_disables_auto_scaling() {
        let mut d = decider();
        let ctx = ScalingContext {
            quality: 99,
            ..busy_ctx()
        };
        assert_eq!(d.calculate_scaling(1920, 1080, 4096, 4096, &ctx, Instant::now()), (1, 1));
    }

    #[test]
    fn heavy_video_load_downscales() {
        let mut d = decider();
        let ctx = ScalingContext {
            fps: 60,
            speed: 100,
            quality: 10,
            bandwidth_limit: 1_000_000,
            ..busy_ctx()
        };
        let r = d.calculate_scaling(3840, 2160, 4096, 4096, &ctx, Instant::now());
        assert_eq!(cmp_ratio(r, (1, 1)), Ordering::Less, "ratio {r:?}");
    }

    #[test]
    fn recent_resize_keeps_current() {
        let mut d = decider();
        let ctx = ScalingContext {
            since_resize: Some(Duration::from_millis(100)),
            ..busy_ctx()
        };
        assert_eq!(d.calculate_scaling(3840, 2160, 4096, 4096, &ctx, Instant::now()), (1, 1));
    }

    #[test]
    fn queries_do_not_move_the_installed_ratio() {
        let mut d = decider();
        let now = Instant::now();
        let ctx = ScalingContext {
            since_resize: Some(Duration::from_millis(100)),
            ..busy_ctx()
        };
        let small = d.calculate_scaling(2000, 2000, 1024, 1024, &ctx, now);
        let large = d.calculate_scaling(2000, 2000, 4096, 4096, &ctx, now);
        assert_eq!(small, (1, 2));
        assert_eq!(large, (1, 1));
        assert_eq!(d.current(), (1, 1));

        d.commit(small, now);
        assert_eq!(d.current(), (1, 2));
        // The hold now keeps the committed downscale.
        assert_eq!(d.calculate_scaling(2000, 2000, 4096, 4096, &ctx, now), (1, 2));
        d.reset();
        assert_eq!(d.calculate_scaling(2000, 2000, 4096, 4096, &ctx, now), (1, 1));
    }

    #[test]
    fn control_mode_fullscreen() {
        let mut policy = PipelinePolicy::default();
        policy.scaling.control = Some(50);
        let mut d = ScalingDecider::new(Arc::new(policy));
        let ctx = ScalingContext {
            fullscreen: true,
            ..busy_ctx()
        };
        assert_eq!(d.calculate_scaling(1920, 1080, 4096, 4096, &ctx, Instant::now()), (1, 3));
    }
}
