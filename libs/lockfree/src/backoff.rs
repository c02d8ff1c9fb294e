// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// An [exponential backoff] for CAS retry loops.
///
/// Every failed compare-and-swap in this crate means another thread made progress, so instead
/// of hammering the contended cache line right away the loser spins for `2^exp` iterations.
/// Once the exponent saturates, [`Backoff::snooze`] starts yielding the OS thread instead.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The default maximum exponent (2^6).
    pub const DEFAULT_MAX_EXPONENT: u8 = 6;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Backs off in a spin loop, issuing `2^exp` spin loop hints.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..(1_u32 << self.exp) {
            // loom can only explore other interleavings if we hand control back to it
            #[cfg(loom)]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }

    /// Like [`Backoff::spin`] but yields the current thread to the OS scheduler once the
    /// exponent is saturated.
    #[inline]
    pub fn snooze(&mut self) {
        if self.exp >= self.max {
            crate::loom::thread::yield_now();
        } else {
            self.spin();
        }
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
    fn snooze_saturates_at_max_exponent() {
        let mut boff = Backoff::new();
        for _ in 0..Backoff::DEFAULT_MAX_EXPONENT {
            assert!(boff.exp < boff.max);
            boff.snooze();
        }
        assert_eq!(boff.exp, Backoff::DEFAULT_MAX_EXPONENT);

        // saturated snoozes yield instead of spinning longer
        boff.snooze();
        assert_eq!(boff.exp, Backoff::DEFAULT_MAX_EXPONENT);
    }
}
