//! Per-window damage statistics.
//!
//! Rolling windows of damage events, damage latencies and sent frames.
//! The batch calculator, the scaler and the video region detector all
//! read from here.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::region::Rectangle;

/// Damage events kept for region detection.
pub const MAX_EVENTS: usize = 400;
/// Latency samples kept for averaging.
const MAX_LATENCIES: usize = 64;
/// Window over which the frame rate is measured.
const FPS_WINDOW: Duration = Duration::from_secs(2);

/// One damage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageEvent {
    pub when: Instant,
    pub rect: Rectangle,
}

/// Rolling statistics for one window.
#[derive(Debug, Clone)]
pub struct WindowStats {
    /// Recent damage events, oldest first.
    events: VecDeque<DamageEvent>,
    /// Damage events since the window was created.
    pub damage_events_count: u64,
    /// Packets sent since the window was created.
    pub packet_count: u64,
    pub last_resized: Option<Instant>,
    pub last_scroll: Option<Instant>,
    /// `(when, damage to encode latency)`.
    latencies: VecDeque<(Instant, Duration)>,
    /// Times at which frames were sent.
    frames: VecDeque<Instant>,
}

impl WindowStats {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
            damage_events_count: 0,
            packet_count: 0,
            last_resized: None,
            last_scroll: None,
            latencies: VecDeque::with_capacity(MAX_LATENCIES),
            frames: VecDeque::with_capacity(64),
        }
    }

    /// Record a damage event.
    pub fn record_damage(&mut self, when: Instant, rect: Rectangle) {
        if self.events.len() == MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(DamageEvent { when, rect });
        self.damage_events_count += 1;
    }

    /// All retained damage events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &DamageEvent> {
        self.events.iter()
    }

    /// Events and pixels within `window` before `now`.
    pub fn recent_load(&self, now: Instant, window: Duration) -> (usize, u64) {
        let since = now.checked_sub(window);
        self.events
            .iter()
            .rev()
            .take_while(|e| since.is_none_or(|s| e.when >= s))
            .fold((0, 0), |(n, px), e| (n + 1, px + e.rect.area()))
    }

    /// Record how long a region waited between damage and encoding.
    pub fn record_latency(&mut self, now: Instant, latency: Duration) {
        if self.latencies.len() == MAX_LATENCIES {
            self.latencies.pop_front();
        }
        self.latencies.push_back((now, latency));
    }

    /// Average damage latency, zero without samples.
    pub fn avg_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().map(|(_, d)| *d).sum();
        total / self.latencies.len() as u32
    }

    /// Record a sent frame.
    pub fn record_frame(&mut self, now: Instant) {
        self.frames.push_back(now);
        self.packet_count += 1;
        self.evict_frames(now);
    }

    /// Frames per second over the last two seconds.
    pub fn fps(&self, now: Instant) -> u32 {
        let since = now.checked_sub(FPS_WINDOW);
        let n = self
            .frames
            .iter()
            .filter(|t| since.is_none_or(|s| **t >= s))
            .count();
        (n as f64 / FPS_WINDOW.as_secs_f64()).round() as u32
    }

    pub fn record_resize(&mut self, now: Instant) {
        self.last_resized = Some(now);
    }

    pub fn record_scroll(&mut self, now: Instant) {
        self.last_scroll = Some(now);
    }

    /// Time since the last resize, `None` if never resized.
    pub fn since_resize(&self, now: Instant) -> Option<Duration> {
        self.last_resized.map(|t| now.saturating_duration_since(t))
    }

    pub fn since_scroll(&self, now: Instant) -> Option<Duration> {
        self.last_scroll.map(|t| now.saturating_duration_since(t))
    }

    fn evict_frames(&mut self, now: Instant) {
        while let Some(&t) = self.frames.front() {
            if now.saturating_duration_since(t) > FPS_WINDOW {
                self.frames.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for WindowStats {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_load_counts_window_only() {
        let mut s = WindowStats::new();
        let t0 = Instant::now();
        s.record_damage(t0, Rectangle::new(0, 0, 10, 10));
        s.record_damage(t0 + Duration::from_millis(1500), Rectangle::new(0, 0, 20, 10));
        s.record_damage(t0 + Duration::from_millis(1800), Rectangle::new(0, 0, 5, 5));
        let (n, px) = s.recent_load(t0 + Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!((n, px), (2, 225));
        assert_eq!(s.damage_events_count, 3);
    }

    #[test]
    fn events_are_bounded() {
        let mut s = WindowStats::new();
        let t0 = Instant::now();
        for _ in 0..MAX_EVENTS + 10 {
            s.record_damage(t0, Rectangle::new(0, 0, 1, 1));
        }
        assert_eq!(s.events().count(), MAX_EVENTS);
        assert_eq!(s.damage_events_count, (MAX_EVENTS + 10) as u64);
    }

    #[test]
    fn fps_over_two_seconds() {
        let mut s = WindowStats::new();
        let t0 = Instant::now();
        for i in 1..=40 {
            s.record_frame(t0 + Duration::from_millis(i * 50));
        }
        assert_eq!(s.fps(t0 + Duration::from_secs(2)), 20);
        assert_eq!(s.fps(t0 + Duration::from_secs(10)), 0);
    }

    #[test]
    fn average_latency() {
        let mut s = WindowStats::new();
        let t0 = Instant::now();
        assert_eq!(s.avg_latency(), Duration::ZERO);
        s.record_latency(t0, Duration::from_millis(10));
        s.record_latency(t0, Duration::from_millis(30));
        assert_eq!(s.avg_latency(), Duration::from_millis(20));
    }
}
