//! Seeded PCG32 (XSH-RR, 64-bit state) used for reproducible network chaos.
//!
//! ```rust
//! use rollback_netplay::rng::Pcg32;
//!
//! let mut a = Pcg32::seed_from_u64(7);
//! let mut b = Pcg32::seed_from_u64(7);
//! assert_eq!(a.gen_range(0..100), b.gen_range(0..100));
//! ```

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

const INCREMENT: u64 = 1442695040888963407;
const MULTIPLIER: u64 = 6364136223846793005;

/// Small deterministic generator. Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a generator from an initial state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut state_acc = inc;
        state_acc = state_acc.wrapping_add(state);
        state_acc = state_acc.wrapping_mul(MULTIPLIER).wrapping_add(inc);
        Self {
            state: state_acc,
            inc,
        }
    }

    /// Creates a generator on the default stream.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, INCREMENT)
    }

    /// Next 32 random bits.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        xorshifted.rotate_right((old >> 59) as u32)
    }

    /// Next 64 random bits.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    /// Uniform value in `range`, without modulo bias.
    ///
    /// An empty range is reported and yields `range.start`.
    pub fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }
        let threshold = span.wrapping_neg() % span;
        loop {
            let value = self.next_u32();
            if value >= threshold {
                return range.start + value % span;
            }
        }
    }

    /// `true` with probability `p`, clamped to `[0, 1]`.
    pub fn gen_bool(&mut self, p: f64) -> bool {
        let p = p.clamp(0.0, 1.0);
        if p >= 1.0 {
            return true;
        }
        let threshold = (p * f64::from(u32::MAX)) as u32;
        self.next_u32() < threshold
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(12345);
        let mut b = Pcg32::seed_from_u64(12345);
        for _ in 0..1000 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn top_bits_are_roughly_uniform() {
        let mut rng = Pcg32::seed_from_u64(42);
        let mut buckets = [0u32; 16];
        for _ in 0..16000 {
            buckets[(rng.next_u32() >> 28) as usize] += 1;
        }
        for &count in &buckets {
            assert!((500..1500).contains(&count), "bucket count {count}");
        }
    }

    #[test]
    fn gen_bool_edges() {
        let mut rng = Pcg32::seed_from_u64(1);
        for _ in 0..100 {
            assert!(!rng.gen_bool(0.0));
            assert!(rng.gen_bool(1.0));
        }
    }

    #[test]
    fn empty_range_returns_start() {
        let mut rng = Pcg32::seed_from_u64(1);
        assert_eq!(rng.gen_range(5..5), 5);
    }

    proptest! {
        #[test]
        fn gen_range_within_bounds(seed in any::<u64>(), start in 0u32..1000, span in 1u32..1000) {
            let mut rng = Pcg32::seed_from_u64(seed);
            for _ in 0..50 {
                let value = rng.gen_range(start..start + span);
                prop_assert!(value >= start && value < start + span);
            }
        }
    }
}
