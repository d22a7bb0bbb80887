//! Adaptive backoff (Crossbeam-style), used wherever a thread must wait for
//! another without a condition variable: a region blocking on its
//! connection's doorbell, or `flush_operation`'s overflow-and-retry loop.

use std::hint;
use std::thread;

/// Progressively increases wait time: spin with a pause hint, then yield to
/// the OS, then give up (the caller should fall back to a real blocking
/// wait).
#[derive(Debug)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    /// Creates a fresh backoff at step zero.
    #[must_use]
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Light spin with pause hints.
    #[inline]
    pub fn spin(&mut self) {
        let spins = 1 << self.step.min(Self::SPIN_LIMIT);
        for _ in 0..spins {
            hint::spin_loop();
        }
        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Heavier backoff: spin while cheap, then yield the OS thread.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            self.spin();
        } else {
            thread::yield_now();
            if self.step <= Self::YIELD_LIMIT {
                self.step += 1;
            }
        }
    }

    /// True once spinning and yielding have both been exhausted; the caller
    /// should switch to a real blocking wait.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }

    /// Resets to step zero for the next wait.
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progresses_from_spin_to_completion() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.step, 0);

        backoff.spin();
        assert!(backoff.step > 0);

        while !backoff.is_completed() {
            backoff.snooze();
        }
        assert!(backoff.step > Backoff::YIELD_LIMIT);

        backoff.reset();
        assert_eq!(backoff.step, 0);
    }
}
