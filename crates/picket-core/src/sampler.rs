//! Allocation-path sampling gate.
//!
//! The gate sits in front of every intercepted allocation and decides which
//! requests divert into the guarded pool. It runs on the host's hot path,
//! possibly under host allocator locks, so it uses plain atomics: no locks,
//! no allocation, and a tolerable amount of raciness under contention.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Lock-free countdown deciding when to divert an allocation.
///
/// The countdown starts at the configured interval. Each [`tick`] counts one
/// request; the call that drains the countdown wins a diversion and installs
/// a fresh count drawn uniformly from half to one-and-a-half intervals, so
/// call sites with periodic allocation patterns are not systematically
/// missed.
///
/// [`tick`]: SampleGate::tick
#[derive(Debug)]
pub struct SampleGate {
    interval: u32,
    countdown: AtomicU32,
    noise: AtomicU64,
}

impl SampleGate {
    /// Creates a gate that diverts roughly every `interval` ticks.
    pub fn new(interval: u32, seed: u64) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            countdown: AtomicU32::new(interval),
            noise: AtomicU64::new(seed | 1),
        }
    }

    /// Counts one allocation request; true when this request diverts.
    pub fn tick(&self) -> bool {
        let mut current = self.countdown.load(Ordering::Relaxed);
        loop {
            let next = if current > 1 {
                current - 1
            } else {
                self.next_reset()
            };
            match self.countdown.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current <= 1,
                Err(observed) => current = observed,
            }
        }
    }

    /// Draws the next countdown from `[interval/2, 3*interval/2]`.
    fn next_reset(&self) -> u32 {
        let lo = u64::from(self.interval / 2).max(1);
        let hi = (u64::from(self.interval) * 3 / 2).max(1);
        let span = hi - lo + 1;
        let value = lo + self.advance_noise() % span;
        value.min(u64::from(u32::MAX)) as u32
    }

    /// xorshift64*; one shared atomic state word, good enough to break up
    /// periodic allocation patterns.
    fn advance_noise(&self) -> u64 {
        let mut current = self.noise.load(Ordering::Relaxed);
        loop {
            let mut next = current;
            next ^= next << 13;
            next ^= next >> 7;
            next ^= next << 17;
            match self.noise.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next.wrapping_mul(0x2545_f491_4f6c_dd1d),
                Err(observed) => current = observed,
            }
        }
    }
}
