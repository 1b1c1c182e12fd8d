//! Adaptive sampling: a global interval driven by drain pressure, plus a
//! per-function rate gate for hot functions.
//!
//! The global interval is read by light hooks in the fast path (one call
//! kept in `interval`); the rate gate runs at drain time and drops a fixed
//! fraction of events for functions that exceed the hot-call threshold,
//! with hysteresis so the gate does not flap around the threshold.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use strobe_wire::SAMPLE_INTERVAL_MAX;

/// Drain-volume driven interval controller.
///
/// The interval is always a power of two in [1, 256]: it doubles after two
/// consecutive heavy drains (≥ 50% of capacity) and halves after five
/// consecutive light drains (≤ 10% of capacity). Mid-band drains reset
/// both streaks.
#[derive(Debug)]
pub struct AdaptiveSampler {
    interval: u32,
    high_cycles: u32,
    low_cycles: u32,
}

const HIGH_CYCLES_TO_DOUBLE: u32 = 2;
const LOW_CYCLES_TO_HALVE: u32 = 5;

impl AdaptiveSampler {
    pub fn new() -> Self {
        Self {
            interval: 1,
            high_cycles: 0,
            low_cycles: 0,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Feed one drain's entry count. Returns the new interval when it
    /// changed, so the caller can publish it to the ring header.
    pub fn observe(&mut self, drained: usize, capacity: usize) -> Option<u32> {
        if drained * 2 >= capacity {
            self.high_cycles += 1;
            self.low_cycles = 0;
            if self.high_cycles >= HIGH_CYCLES_TO_DOUBLE {
                self.high_cycles = 0;
                if self.interval < SAMPLE_INTERVAL_MAX {
                    self.interval *= 2;
                    return Some(self.interval);
                }
            }
        } else if drained * 10 <= capacity {
            self.low_cycles += 1;
            self.high_cycles = 0;
            if self.low_cycles >= LOW_CYCLES_TO_HALVE {
                self.low_cycles = 0;
                if self.interval > 1 {
                    self.interval /= 2;
                    return Some(self.interval);
                }
            }
        } else {
            self.high_cycles = 0;
            self.low_cycles = 0;
        }
        None
    }
}

impl Default for AdaptiveSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateTrackerConfig {
    /// Calls per second at which per-function sampling turns on.
    pub hot_threshold: u64,
    /// While hot, keep one drained event in this many.
    pub keep_one_in: u32,
    /// Sampling turns off only after the rate stays below 80% of the
    /// threshold for this long.
    pub cooldown: Duration,
}

impl Default for RateTrackerConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 100_000,
            keep_one_in: 100,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// A sampling on/off flip for one function, published to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingTransition {
    pub func_id: u32,
    pub enabled: bool,
}

#[derive(Debug)]
struct FuncRate {
    window_start: Instant,
    count_in_window: u64,
    sampling: bool,
    below_since: Option<Instant>,
    keep_counter: u32,
}

/// Rolling one-second call-rate tracker with a drain-side drop gate.
pub struct RateTracker {
    cfg: RateTrackerConfig,
    funcs: HashMap<u32, FuncRate>,
    transitions: Vec<SamplingTransition>,
}

impl RateTracker {
    pub fn new(cfg: RateTrackerConfig) -> Self {
        Self {
            cfg,
            funcs: HashMap::new(),
            transitions: Vec::new(),
        }
    }

    /// Count one drained call for `func_id` and decide whether the drain
    /// keeps it. Returns false for the dropped fraction of a hot function.
    pub fn observe(&mut self, func_id: u32, now: Instant) -> bool {
        let f = self.funcs.entry(func_id).or_insert_with(|| FuncRate {
            window_start: now,
            count_in_window: 0,
            sampling: false,
            below_since: None,
            keep_counter: 0,
        });

        if now.duration_since(f.window_start) >= Duration::from_secs(1) {
            let rate = f.count_in_window;
            f.count_in_window = 0;
            f.window_start = now;
            Self::apply_rate(&self.cfg, &mut self.transitions, func_id, f, rate, now);
        }
        f.count_in_window += 1;

        if f.sampling {
            f.keep_counter = f.keep_counter.wrapping_add(1);
            f.keep_counter % self.cfg.keep_one_in == 0
        } else {
            true
        }
    }

    /// Close out idle windows so hysteresis advances for functions that
    /// went quiet. Called once per drain tick.
    pub fn tick(&mut self, now: Instant) {
        for (&func_id, f) in self.funcs.iter_mut() {
            if now.duration_since(f.window_start) >= Duration::from_secs(1) {
                let rate = f.count_in_window;
                f.count_in_window = 0;
                f.window_start = now;
                Self::apply_rate(&self.cfg, &mut self.transitions, func_id, f, rate, now);
            }
        }
    }

    fn apply_rate(
        cfg: &RateTrackerConfig,
        transitions: &mut Vec<SamplingTransition>,
        func_id: u32,
        f: &mut FuncRate,
        rate: u64,
        now: Instant,
    ) {
        if !f.sampling {
            if rate >= cfg.hot_threshold {
                f.sampling = true;
                f.below_since = None;
                f.keep_counter = 0;
                transitions.push(SamplingTransition {
                    func_id,
                    enabled: true,
                });
            }
            return;
        }
        // Hysteresis: only a sustained drop below 80% of the threshold
        // turns sampling off.
        if rate * 10 < cfg.hot_threshold * 8 {
            let since = *f.below_since.get_or_insert(now);
            if now.duration_since(since) >= cfg.cooldown {
                f.sampling = false;
                f.below_since = None;
                transitions.push(SamplingTransition {
                    func_id,
                    enabled: false,
                });
            }
        } else {
            f.below_since = None;
        }
    }

    pub fn is_sampling(&self, func_id: u32) -> bool {
        self.funcs.get(&func_id).map(|f| f.sampling).unwrap_or(false)
    }

    pub fn take_transitions(&mut self) -> Vec<SamplingTransition> {
        std::mem::take(&mut self.transitions)
    }

    pub fn clear(&mut self) {
        self.funcs.clear();
        self.transitions.clear();
    }
}
