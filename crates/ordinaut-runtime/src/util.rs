use std::time::Duration;

use sqlx::postgres::types::PgInterval;

/// Convert a [`Duration`] into a value bindable as a Postgres `interval`.
pub(crate) fn pg_interval(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: duration.as_micros().try_into().unwrap_or(i64::MAX),
    }
}

/// Jitter an interval downwards by up to a quarter of its length.
pub(crate) fn jittered(interval: Duration) -> Duration {
    use rand::Rng;

    let max_jitter = (interval / 4).as_nanos();
    if max_jitter == 0 {
        return interval;
    }

    let jitter = rand::thread_rng().gen_range(0..max_jitter);
    interval - Duration::from_nanos(jitter as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_conversion_is_microsecond_precise() {
        let interval = pg_interval(Duration::from_millis(1500));
        assert_eq!(interval.microseconds, 1_500_000);
        assert_eq!(interval.months, 0);
        assert_eq!(interval.days, 0);
    }

    #[test]
    fn jitter_stays_within_a_quarter_period() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = jittered(base);
            assert!(jittered <= base);
            assert!(jittered >= base - base / 4);
        }
    }
}
