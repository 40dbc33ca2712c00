//! Property-based tests for TTL jitter
//!
//! For any base duration, the jittered duration never shrinks and never
//! exceeds the bucketed upper bound: `d <= d' <= d * (1 + upper(d))`.

use layered_cache::ttl_jitter::{jitter, jitter_upper_bound};
use quickcheck::{Arbitrary, Gen, QuickCheck};
use std::time::Duration;

// ============================================================================
// Test Data Structures
// ============================================================================

/// A base TTL between one second and one week.
#[derive(Debug, Clone, Copy)]
struct BaseTtl(Duration);

impl Arbitrary for BaseTtl {
    fn arbitrary(g: &mut Gen) -> Self {
        const ONE_WEEK_SECS: u64 = 7 * 24 * 60 * 60;
        let secs = (u64::arbitrary(g) % ONE_WEEK_SECS) + 1;
        BaseTtl(Duration::from_secs(secs))
    }
}

// ============================================================================
// Properties
// ============================================================================

fn prop_jitter_within_bucket_bounds(ttl: BaseTtl) -> bool {
    let base = ttl.0;
    let upper = jitter_upper_bound(base);
    let jittered = jitter(base);

    // Tolerance for mul_f64 rounding at the top of the range.
    let max = base.mul_f64(1.0 + upper) + Duration::from_millis(1);
    jittered >= base && jittered <= max
}

fn prop_minute_or_less_is_exact(secs: u8) -> bool {
    let base = Duration::from_secs(u64::from(secs) % 61);
    jitter(base) == base
}

fn prop_upper_bound_is_monotonically_nonincreasing(a: BaseTtl, b: BaseTtl) -> bool {
    let (short, long) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
    // Ignore the no-jitter bucket, which sits below all others.
    if short <= Duration::from_secs(60) {
        return true;
    }
    jitter_upper_bound(short) >= jitter_upper_bound(long)
}

#[test]
fn jitter_within_bucket_bounds() {
    QuickCheck::new()
        .tests(1000)
        .quickcheck(prop_jitter_within_bucket_bounds as fn(BaseTtl) -> bool);
}

#[test]
fn minute_or_less_is_exact() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop_minute_or_less_is_exact as fn(u8) -> bool);
}

#[test]
fn upper_bound_is_monotonically_nonincreasing() {
    QuickCheck::new()
        .tests(500)
        .quickcheck(prop_upper_bound_is_monotonically_nonincreasing as fn(BaseTtl, BaseTtl) -> bool);
}
