//! TTL Jitter Module
//!
//! Randomised upward extension of cache durations so entries written
//! together do not all expire together. The multiplier is bucketed by the
//! base duration: short TTLs get proportionally more spread.

use std::time::Duration;

const ONE_MINUTE: Duration = Duration::from_secs(60);
const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);
const SIX_HOURS: Duration = Duration::from_secs(6 * 60 * 60);
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound of the random multiplier bucket for `duration`.
///
/// The jittered duration is `duration * (1 + rand * upper)`, so e.g. a
/// 10-minute TTL may stretch up to 2.2x.
pub fn jitter_upper_bound(duration: Duration) -> f64 {
    if duration <= ONE_MINUTE {
        0.0
    } else if duration <= FIFTEEN_MINUTES {
        1.2
    } else if duration <= ONE_HOUR {
        1.15
    } else if duration <= SIX_HOURS {
        1.10
    } else if duration <= ONE_DAY {
        1.05
    } else {
        1.025
    }
}

/// Apply bucketed upward jitter to a duration.
pub fn jitter(duration: Duration) -> Duration {
    let upper = jitter_upper_bound(duration);
    if upper == 0.0 {
        return duration;
    }
    let multiplier = 1.0 + fastrand::f64() * upper;
    duration.mul_f64(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_durations_are_untouched() {
        let d = Duration::from_secs(45);
        assert_eq!(jitter(d), d);
    }

    #[test]
    fn jitter_stays_within_bucket_bounds() {
        let cases = [
            (Duration::from_secs(10 * 60), 1.2),
            (Duration::from_secs(50 * 60), 1.15),
            (Duration::from_secs(5 * 60 * 60), 1.10),
            (Duration::from_secs(20 * 60 * 60), 1.05),
            (Duration::from_secs(3 * 24 * 60 * 60), 1.025),
        ];
        for (base, upper) in cases {
            for _ in 0..200 {
                let jittered = jitter(base);
                assert!(jittered >= base, "jitter must never shorten a TTL");
                let max = base.mul_f64(1.0 + upper) + Duration::from_millis(1);
                assert!(
                    jittered <= max,
                    "jittered {:?} exceeded bucket max {:?} for base {:?}",
                    jittered,
                    max,
                    base
                );
            }
        }
    }

    #[test]
    fn bucket_edges() {
        assert_eq!(jitter_upper_bound(Duration::from_secs(60)), 0.0);
        assert_eq!(jitter_upper_bound(Duration::from_secs(61)), 1.2);
        assert_eq!(jitter_upper_bound(Duration::from_secs(900)), 1.2);
        assert_eq!(jitter_upper_bound(Duration::from_secs(901)), 1.15);
        assert_eq!(jitter_upper_bound(Duration::from_secs(3600)), 1.15);
        assert_eq!(jitter_upper_bound(Duration::from_secs(3601)), 1.10);
        assert_eq!(jitter_upper_bound(Duration::from_secs(21600)), 1.10);
        assert_eq!(jitter_upper_bound(Duration::from_secs(86400)), 1.05);
        assert_eq!(jitter_upper_bound(Duration::from_secs(86401)), 1.025);
    }
}
