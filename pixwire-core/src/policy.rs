//! Immutable tuning policy for the encoding pipeline.
//!
//! A `PipelinePolicy` is built once (usually from the server config file),
//! normalised, and shared as `Arc<PipelinePolicy>` by every component that
//! needs a tunable. Nothing mutates it afterwards.
//!
//! | Section       | Used by                                   |
//! |---------------|-------------------------------------------|
//! | `compression` | `FrameCodec`, picture encoders            |
//! | `batch`       | `BatchConfig`, `WindowSource`             |
//! | `scaling`     | `ScalingDecider`                          |
//! | `scroll`      | `ScrollData`, `WindowVideoEncoder`        |
//! | `video`       | `VideoSubregion`, `WindowVideoEncoder`    |
//! | `av_sync`     | `WindowSource` encode queue               |
//! | `scoring`     | `PipelineScorer`                          |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::{self, Algorithm};

/// Top-level pipeline policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelinePolicy {
    /// Payload compression and framing.
    pub compression: CompressionPolicy,
    /// Damage batching.
    pub batch: BatchPolicy,
    /// Video downscaling.
    pub scaling: ScalingPolicy,
    /// Scroll detection.
    pub scroll: ScrollPolicy,
    /// Video region detection and encoder lifecycle.
    pub video: VideoPolicy,
    /// Audio/video synchronisation.
    pub av_sync: AvSyncPolicy,
    /// Pipeline scoring weights.
    pub scoring: ScoringPolicy,
}

/// Packet body serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    Bincode,
    Json,
}

/// Compression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionPolicy {
    /// Enabled compressors ("lz4", "zstd").
    pub compressors: Vec<String>,
    /// Compression level, 0 disables compression.
    pub level: u8,
    /// Payloads up to this size are sent uncompressed.
    pub min_compress_size: usize,
    /// Minimum bytes a compressor must save.
    pub min_saving: usize,
    /// Payloads above this size travel as raw chunks.
    pub inline_size: usize,
    /// Main packet serializer.
    pub serializer: Serializer,
}

/// Batching settings (milliseconds unless noted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Initial batch delay.
    pub start_delay_ms: u64,
    /// Lower bound of the batch delay.
    pub min_delay_ms: u64,
    /// Upper bound of the batch delay.
    pub max_delay_ms: u64,
    /// More events than this per time unit forces batching.
    pub max_events: usize,
    /// More pixels than this per time unit forces batching.
    pub max_pixels: u64,
    /// Window used for the event and pixel counts.
    pub time_unit_ms: u64,
    /// Always batch, even isolated damage.
    pub always: bool,
    /// Output backlog above which damage is always batched.
    pub max_backlog: usize,
    /// Minimum interval between two batch delay recalculations.
    pub recalculate_ms: u64,
}

/// Scaling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    /// Allow downscaling video frames.
    pub enabled: bool,
    /// Fixed `(num, den)` ratio, used as an upper bound.
    pub hardcoded: Option<(u32, u32)>,
    /// `None` = automatic, `0` = only when required, `1..=100` = control mode.
    pub control: Option<u8>,
    /// Quality at or above which auto mode does not scale.
    pub q_noscaling: u8,
    /// Same threshold for video content.
    pub q_noscaling_video: u8,
    /// Lower bound of the pixels-per-second target.
    pub min_pps: u64,
    /// Pixels-per-second target without a bandwidth limit.
    pub pps_target: u64,
}

/// Scroll detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollPolicy {
    /// Try scroll encoding for video windows.
    pub enabled: bool,
    /// Minimum matching row percentage to use scroll encoding.
    pub min_percent: u8,
    /// Maximum number of zones plus non-scroll ranges.
    pub max_zones: usize,
}

/// Video region and encoder lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoPolicy {
    /// Enable video subregion detection.
    pub subregion: bool,
    /// Events since detection before a region counts as video.
    pub min_video_events: u64,
    /// Frame rate before a region counts as video.
    pub min_video_fps: u32,
    /// Idle timeout once a region is confirmed.
    pub idle_timeout_ms: u64,
    /// Idle timeout while still detecting.
    pub idle_timeout_detect_ms: u64,
    /// Lower bound of the B-frame flush delay.
    pub flush_min_ms: u64,
    /// Upper bound of the B-frame flush delay.
    pub flush_max_ms: u64,
    /// Delay before refreshing a lossy video region.
    pub auto_refresh_delay_ms: u64,
    /// Longest wait for the non-video part of a window.
    pub non_max_wait_ms: u64,
    /// Areas never considered video: `(x, y, w, h)`,
    /// negative x/y are relative to the right/bottom edge.
    pub exclusion_zones: Vec<(i32, i32, u32, u32)>,
    /// Initial quality for new windows.
    pub initial_quality: u8,
    /// Initial speed for new windows.
    pub initial_speed: u8,
    /// Quality floor.
    pub min_quality: u8,
    /// Speed floor.
    pub min_speed: u8,
}

/// AV-sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvSyncPolicy {
    pub enabled: bool,
    /// Delay applied to video frames.
    pub delay_ms: u64,
    /// Queue length at which frames bypass the delay.
    pub queue_size: usize,
    /// Minimum gap between two queue timer firings.
    pub min_gap_ms: u64,
}

/// Pipeline scoring weights. Scores are distances: lower wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub quality_weight: f64,
    pub speed_weight: f64,
    /// Added when an option cannot reach the minimum quality or speed.
    pub below_min_penalty: f64,
    /// Added for scaling or lossy subsampling when lossless is wanted.
    pub lossless_penalty: f64,
    /// Added for lossy subsampling of text content.
    pub text_penalty: f64,
    /// Subtracted when the option matches the active pipeline.
    pub stability_bonus: f64,
    /// Multiplies the setup cost of a new pipeline.
    pub setup_cost_weight: f64,
    /// Multiplies the encoding preference bias.
    pub order_bias_weight: f64,
    /// Multiplies the CPU (or GPU) cost.
    pub cost_weight: f64,
    /// Score cache lifetime.
    pub cache_ms: u64,
    /// Cache lifetime when inputs are unchanged.
    pub idle_cache_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            compression: CompressionPolicy::default(),
            batch: BatchPolicy::default(),
            scaling: ScalingPolicy::default(),
            scroll: ScrollPolicy::default(),
            video: VideoPolicy::default(),
            av_sync: AvSyncPolicy::default(),
            scoring: ScoringPolicy::default(),
        }
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            compressors: vec!["lz4".into(), "zstd".into()],
            level: 1,
            min_compress_size: compression::MIN_COMPRESS_SIZE,
            min_saving: compression::DEFAULT_MIN_SAVING,
            inline_size: compression::INLINE_SIZE,
            serializer: Serializer::Bincode,
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            start_delay_ms: 50,
            min_delay_ms: 5,
            max_delay_ms: 15_000,
            max_events: 50,
            max_pixels: 50 * 1024 * 1024,
            time_unit_ms: 1000,
            always: false,
            max_backlog: 4,
            recalculate_ms: 40,
        }
    }
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            hardcoded: None,
            control: None,
            q_noscaling: 65,
            q_noscaling_video: 95,
            min_pps: 1920 * 1080,
            pps_target: 25 * 1920 * 1080,
        }
    }
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_percent: 30,
            max_zones: 20,
        }
    }
}

impl Default for VideoPolicy {
    fn default() -> Self {
        Self {
            subregion: true,
            min_video_events: 20,
            min_video_fps: 10,
            idle_timeout_ms: 600_000,
            idle_timeout_detect_ms: 10_000,
            flush_min_ms: 150,
            flush_max_ms: 500,
            auto_refresh_delay_ms: 150,
            non_max_wait_ms: 150,
            exclusion_zones: Vec::new(),
            initial_quality: 40,
            initial_speed: 40,
            min_quality: 10,
            min_speed: 10,
        }
    }
}

impl Default for AvSyncPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 150,
            queue_size: 10,
            min_gap_ms: 5,
        }
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            quality_weight: 1.0,
            speed_weight: 1.0,
            below_min_penalty: 1000.0,
            lossless_penalty: 200.0,
            text_penalty: 50.0,
            stability_bonus: 20.0,
            setup_cost_weight: 0.2,
            order_bias_weight: 5.0,
            cost_weight: 0.25,
            cache_ms: 750,
            idle_cache_ms: 60_000,
        }
    }
}

// ── Normalisation ────────────────────────────────────────────────

impl PipelinePolicy {
    /// Clamp every knob into its valid range.
    pub fn normalized(mut self) -> Self {
        let c = &mut self.compression;
        c.level = c.level.min(15);
        c.min_compress_size = c.min_compress_size.max(1);
        c.inline_size = c.inline_size.clamp(1024, compression::MAX_SIZE);

        let b = &mut self.batch;
        b.min_delay_ms = b.min_delay_ms.max(1);
        b.max_delay_ms = b.max_delay_ms.max(b.min_delay_ms);
        b.start_delay_ms = b.start_delay_ms.clamp(b.min_delay_ms, b.max_delay_ms);
        b.time_unit_ms = b.time_unit_ms.max(1);
        b.max_events = b.max_events.max(1);

        let s = &mut self.scaling;
        if let Some((num, den)) = s.hardcoded {
            s.hardcoded = if num == 0 || den == 0 || num > den {
                None
            } else {
                Some((num, den))
            };
        }
        s.control = s.control.map(|c| c.min(100));
        s.q_noscaling = s.q_noscaling.min(100);
        s.q_noscaling_video = s.q_noscaling_video.min(100);

        let sc = &mut self.scroll;
        sc.min_percent = sc.min_percent.min(100);
        sc.max_zones = sc.max_zones.max(1);

        let v = &mut self.video;
        v.flush_min_ms = v.flush_min_ms.max(1);
        v.flush_max_ms = v.flush_max_ms.max(v.flush_min_ms);
        v.min_quality = v.min_quality.min(100);
        v.min_speed = v.min_speed.min(100);
        v.initial_quality = v.initial_quality.clamp(v.min_quality, 100);
        v.initial_speed = v.initial_speed.clamp(v.min_speed, 100);

        let a = &mut self.av_sync;
        a.delay_ms = a.delay_ms.min(1000);
        a.queue_size = a.queue_size.max(1);

        let w = &mut self.scoring;
        w.idle_cache_ms = w.idle_cache_ms.max(w.cache_ms);
        self
    }

    /// Enabled compressors, in configuration order.
    pub fn enabled_compressors(&self) -> Vec<Algorithm> {
        compression::parse_enabled(&self.compression.compressors)
    }
}

impl BatchPolicy {
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }
}

impl ScrollPolicy {
    /// Zone cap; unlimited percentage thresholds allow more zones.
    pub fn zone_cap(&self) -> usize {
        if self.min_percent == 0 { self.max_zones.max(50) } else { self.max_zones }
    }
}

// ── Tests ────────────────────────────────────────────────────────
