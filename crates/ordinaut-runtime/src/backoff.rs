//! Retry delay computation.

use std::time::Duration;

use crate::model::BackoffKind;

/// Delays never exceed this, regardless of strategy or attempt count.
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Compute the delay before re-enqueueing a failed firing.
///
/// `attempt` is the 1-based attempt that just failed; `base` comes from the
/// runtime configuration (2s by default).
pub fn retry_delay(kind: BackoffKind, attempt: i32, base: Duration) -> Duration {
    use rand::Rng;

    match kind {
        BackoffKind::ExponentialJitter => {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            exponential_delay(attempt, base, factor)
        }
        BackoffKind::Fixed => base.min(MAX_DELAY),
        BackoffKind::Linear => scale(base, attempt.max(1) as u32).min(MAX_DELAY),
    }
}

fn exponential_delay(attempt: i32, base: Duration, factor: f64) -> Duration {
    let exponent = attempt.max(1) as u32 - 1;
    let unjittered = match 2u32.checked_pow(exponent) {
        Some(multiplier) => scale(base, multiplier),
        None => MAX_DELAY,
    };

    unjittered.mul_f64(factor).min(MAX_DELAY)
}

fn scale(base: Duration, multiplier: u32) -> Duration {
    base.checked_mul(multiplier).unwrap_or(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(2);

    #[test]
    fn exponential_doubles_per_attempt() {
        assert_eq!(exponential_delay(1, BASE, 1.0), Duration::from_secs(2));
        assert_eq!(exponential_delay(2, BASE, 1.0), Duration::from_secs(4));
        assert_eq!(exponential_delay(3, BASE, 1.0), Duration::from_secs(8));
        assert_eq!(exponential_delay(5, BASE, 1.0), Duration::from_secs(32));
    }

    #[test]
    fn exponential_caps_at_five_minutes() {
        assert_eq!(exponential_delay(20, BASE, 1.5), MAX_DELAY);
        // Large exponents must not overflow.
        assert_eq!(exponential_delay(i32::MAX, BASE, 1.0), MAX_DELAY);
    }

    #[test]
    fn jitter_stays_in_band() {
        for attempt in 1..=5 {
            let floor = exponential_delay(attempt, BASE, 0.5);
            let ceiling = exponential_delay(attempt, BASE, 1.5);
            for _ in 0..50 {
                let delay = retry_delay(BackoffKind::ExponentialJitter, attempt, BASE);
                assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
                assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn fixed_is_constant() {
        assert_eq!(retry_delay(BackoffKind::Fixed, 1, Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(retry_delay(BackoffKind::Fixed, 9, Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn linear_grows_with_attempt() {
        assert_eq!(retry_delay(BackoffKind::Linear, 1, BASE), Duration::from_secs(2));
        assert_eq!(retry_delay(BackoffKind::Linear, 3, BASE), Duration::from_secs(6));
        assert_eq!(retry_delay(BackoffKind::Linear, 1000, BASE), MAX_DELAY);
    }
}
