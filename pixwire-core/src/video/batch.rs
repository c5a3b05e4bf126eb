//! Damage batching configuration and the batch-delay calculator.
//!
//! Each window owns a [`BatchConfig`], cloned from the session default.
//! The delay moves towards a time-weighted average of recent delays and
//! the targets suggested by a set of weighted [`Factor`]s.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::policy::BatchPolicy;

/// Delay history length.
const HISTORY: usize = 64;

/// `log2(1 + x)`.
pub fn logp(x: f64) -> f64 {
    (1.0 + x).log2()
}

/// One input to the delay calculation.
///
/// `factor` multiplies the current delay (1.0 = keep), `weight` sets how
/// much it counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    pub name: &'static str,
    pub factor: f64,
    pub weight: f64,
}

impl Factor {
    pub fn new(name: &'static str, factor: f64, weight: f64) -> Self {
        Self { name, factor, weight }
    }
}

/// Per-window batching state.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Current batch delay in milliseconds.
    pub delay: u64,
    pub min_delay: u64,
    pub max_delay: u64,
    pub max_events: usize,
    pub max_pixels: u64,
    pub time_unit: Duration,
    pub always: bool,
    /// Backlog above which damage is always batched.
    pub max_backlog: usize,
    /// Minimum interval between recalculations.
    pub recalculate: Duration,
    pub last_updated: Option<Instant>,
    /// Delays we tried to use.
    last_delays: VecDeque<(Instant, u64)>,
    /// Delays actually observed between damage and processing.
    last_actual_delays: VecDeque<(Instant, u64)>,
}

impl BatchConfig {
    pub fn from_policy(policy: &BatchPolicy) -> Self {
        Self {
            delay: policy.start_delay_ms.clamp(policy.min_delay_ms, policy.max_delay_ms),
            min_delay: policy.min_delay_ms,
            max_delay: policy.max_delay_ms,
            max_events: policy.max_events,
            max_pixels: policy.max_pixels,
            time_unit: policy.time_unit(),
            always: policy.always,
            max_backlog: policy.max_backlog,
            recalculate: Duration::from_millis(policy.recalculate_ms),
            last_updated: None,
            last_delays: VecDeque::with_capacity(HISTORY),
            last_actual_delays: VecDeque::with_capacity(HISTORY),
        }
    }

    /// Fresh per-window copy: settings and current delay, no history.
    pub fn clone_settings(&self) -> Self {
        Self {
            last_updated: None,
            last_delays: VecDeque::with_capacity(HISTORY),
            last_actual_delays: VecDeque::with_capacity(HISTORY),
            ..self.clone()
        }
    }

    pub fn delay_duration(&self) -> Duration {
        Duration::from_millis(self.delay)
    }

    /// Record the delay we asked for.
    pub fn record_delay(&mut self, now: Instant, delay: u64) {
        push_bounded(&mut self.last_delays, (now, delay));
    }

    /// Record the delay that actually elapsed.
    pub fn record_actual_delay(&mut self, now: Instant, delay: u64) {
        push_bounded(&mut self.last_actual_delays, (now, delay));
    }

    /// Whether enough time has passed since the last update.
    pub fn due_for_update(&self, now: Instant) -> bool {
        match self.last_updated {
            Some(t) => now.saturating_duration_since(t) >= self.recalculate,
            None => true,
        }
    }

    /// Recompute the delay from `factors`.
    ///
    /// Starts from a time-weighted average of the delay history (requested
    /// 25%, actual 75%, older samples decaying faster the less we batch),
    /// then blends in `current * factor` for every factor. The result is
    /// clamped to `[max(min_delay, floor), max_delay]`.
    pub fn update_delay(&mut self, factors: &[Factor], now: Instant) {
        self.update_delay_with_floor(factors, 0, now);
    }

    pub fn update_delay_with_floor(&mut self, factors: &[Factor], floor: u64, now: Instant) {
        let current = self.delay as f64;
        let max_delay = self.max_delay as f64;
        let decay = (logp(current / self.min_delay.max(1) as f64) / 5.0).max(1.0);

        let (mut tv, mut tw) = (0.0f64, 0.0f64);
        for (history, d_weight) in [(&self.last_delays, 0.25), (&self.last_actual_delays, 0.75)] {
            for &(when, delay) in history {
                let age = now.saturating_duration_since(when).as_secs_f64();
                let w = d_weight / (1.0 + (age / decay).powi(2));
                tv += (delay as f64).min(max_delay) * w;
                tw += w;
            }
        }
        let hist_w = tw;

        let all_weight: f64 = factors.iter().map(|f| f.weight).sum();
        if all_weight <= 0.0 {
            tracing::trace!("update_delay: no weights yet");
            return;
        }
        for f in factors {
            let target = (current * f.factor).clamp(0.0, max_delay);
            let w = hist_w.max(1.0) * f.weight / all_weight;
            tw += w;
            tv += target * w;
            tracing::trace!(factor = f.name, value = f.factor, weight = f.weight, "batch factor");
        }
        let min = self.min_delay.max(floor);
        self.delay = ((tv / tw) as u64).clamp(min, self.max_delay.max(min));
        self.last_updated = Some(now);
        self.record_delay(now, self.delay);
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from_policy(&BatchPolicy::default())
    }
}

fn push_bounded(q: &mut VecDeque<(Instant, u64)>, v: (Instant, u64)) {
    if q.len() == HISTORY {
        q.pop_front();
    }
    q.push_back(v);
}

// ── Factors ──────────────────────────────────────────────────────

/// Output backlog: packets queued for the network writer.
pub fn backlog_factor(backlog: usize) -> Factor {
    let b = backlog as f64;
    Factor::new("backlog", 0.5 + logp(b / 2.0), 1.0 + b.min(4.0) / 4.0)
}

/// Damage latency (damage to encode) against a target.
pub fn latency_factor(avg_latency: Duration, target: Duration) -> Factor {
    let target = target.as_secs_f64().max(0.001);
    let ratio = avg_latency.as_secs_f64() / target;
    Factor::new("damage-latency", logp(ratio), 0.5 + ratio.min(2.0) / 4.0)
}

/// Damage event rate against the batching threshold.
pub fn event_rate_factor(events_per_unit: usize, max_events: usize) -> Factor {
    let ratio = events_per_unit as f64 / (max_events.max(2) as f64 / 2.0);
    Factor::new("event-rate", logp(ratio), 0.25)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_start_delay() {
        let b = BatchConfig::default();
        assert_eq!(b.delay, 50);
        assert_eq!(b.min_delay, 5);
        assert_eq!(b.max_delay, 15_000);
        assert_eq!(b.max_events, 50);
    }

    #[test]
    fn high_factor_raises_delay() {
        let mut b = BatchConfig::default();
        let now = Instant::now();
        b.update_delay(&[Factor::new("test", 4.0, 1.0)], now);
        assert!(b.delay > 50, "delay = {}", b.delay);
        assert!(b.delay <= 200);
        assert_eq!(b.last_updated, Some(now));
    }

    #[test]
    fn zero_factor_lowers_to_min() {
        let mut b = BatchConfig::default();
        let now = Instant::now();
        for i in 0..20 {
            b.update_delay(&[Factor::new("idle", 0.0, 1.0)], now + Duration::from_millis(i * 50));
        }
        assert!(b.delay < 20, "delay = {}", b.delay);
        assert!(b.delay >= b.min_delay);
    }

    #[test]
    fn delay_stays_in_bounds() {
        let mut b = BatchConfig::default();
        let now = Instant::now();
        for i in 0..200 {
            b.update_delay(&[Factor::new("huge", 100.0, 1.0)], now + Duration::from_millis(i));
            assert!(b.delay >= b.min_delay && b.delay <= b.max_delay);
        }
        assert!(b.delay > 10_000, "delay = {}", b.delay);
    }

    #[test]
    fn no_weight_keeps_delay() {
        let mut b = BatchConfig::default();
        b.update_delay(&[], Instant::now());
        assert_eq!(b.delay, 50);
        assert!(b.last_updated.is_none());
    }

    #[test]
    fn history_is_bounded() {
        let mut b = BatchConfig::default();
        let now = Instant::now();
        for i in 0..100 {
            b.record_actual_delay(now, i);
        }
        assert_eq!(b.last_actual_delays.len(), HISTORY);
        let c = b.clone_settings();
        assert!(c.last_actual_delays.is_empty());
        assert_eq!(c.delay, b.delay);
    }

    #[test]
    fn factor_shapes() {
        assert!(backlog_factor(0).factor < 1.0);
        assert!(backlog_factor(8).factor > 1.0);
        assert_eq!(latency_factor(Duration::from_millis(50), Duration::from_millis(50)).factor, 1.0);
        assert_eq!(event_rate_factor(0, 50).factor, 0.0);
    }
}
