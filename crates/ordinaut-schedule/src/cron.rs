//! Cron evaluation in an IANA timezone.
//!
//! Candidate firing times are generated in the task's local wall-clock time
//! and only then resolved to instants. This is what makes DST transitions
//! behave: a firing that lands in a skipped hour slides forward to the first
//! valid local time, and a firing in a repeated hour resolves to the first
//! occurrence instead of firing twice.

use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::ScheduleError;

/// Upper bound on wall-clock candidates examined per call. Only pathological
/// expressions (every candidate inside a DST gap) get anywhere near it.
const MAX_CANDIDATES: usize = 128;

/// Minutes to probe forward when a candidate falls in a DST gap. Gaps are at
/// most a couple of hours in every zone chrono-tz knows about.
const MAX_SLIDE_MINUTES: i64 = 26 * 60;

pub(crate) fn parse(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        // Standard 5-field cron; the cron crate wants a seconds field.
        5 => format!("0 {expression}"),
        6 => expression.to_string(),
        n => return Err(ScheduleError::CronFieldCount(n)),
    };

    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::Cron {
        expr: expression.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn next_fire(
    schedule: &cron::Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // Represent the local wall clock as a fake UTC timeline so the cron
    // iterator steps over it without any DST awareness of its own.
    let wall_after = fake_utc(after.with_timezone(&tz).naive_local());

    for candidate in schedule.after(&wall_after).take(MAX_CANDIDATES) {
        let wall = candidate.naive_utc();
        let resolved = match tz.from_local_datetime(&wall) {
            LocalResult::Single(dt) => Some(dt),
            // Repeated hour: fire once, at the first occurrence.
            LocalResult::Ambiguous(first, _) => Some(first),
            // Skipped hour: slide forward to the first valid local time.
            LocalResult::None => slide_forward(tz, wall),
        };

        match resolved.map(|dt| dt.with_timezone(&Utc)) {
            Some(instant) if instant > after => return Some(instant),
            // A repeated hour can resolve to an instant at or before `after`
            // even though the wall time advanced. Keep looking.
            _ => continue,
        }
    }

    None
}

fn slide_forward(tz: Tz, from: NaiveDateTime) -> Option<DateTime<Tz>> {
    let mut wall = from;
    for _ in 0..MAX_SLIDE_MINUTES {
        wall += Duration::minutes(1);
        match tz.from_local_datetime(&wall) {
            LocalResult::Single(dt) => return Some(dt),
            LocalResult::Ambiguous(first, _) => return Some(first),
            LocalResult::None => continue,
        }
    }

    None
}

fn fake_utc(wall: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(wall, Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Schedule, ScheduleKind};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn cron(expr: &str, tz: &str) -> Schedule {
        Schedule::parse(ScheduleKind::Cron, expr, tz, Utc::now()).unwrap()
    }

    #[test]
    fn five_field_expressions_fire_on_the_minute() {
        let schedule = cron("30 14 * * *", "UTC");
        let fire = schedule.next_fire(utc("2024-06-01T00:00:00Z")).unwrap();
        assert_eq!(fire, utc("2024-06-01T14:30:00Z"));
    }

    #[test]
    fn six_field_expressions_carry_seconds() {
        let schedule = cron("15 0 9 * * *", "UTC");
        let fire = schedule.next_fire(utc("2024-06-01T00:00:00Z")).unwrap();
        assert_eq!(fire, utc("2024-06-01T09:00:15Z"));
    }

    #[test]
    fn field_count_is_validated() {
        for expr in ["* * * *", "* * * * * * *"] {
            let err = Schedule::parse(ScheduleKind::Cron, expr, "UTC", Utc::now()).unwrap_err();
            assert!(matches!(err, ScheduleError::CronFieldCount(_)), "{expr}");
        }
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        let err =
            Schedule::parse(ScheduleKind::Cron, "61 * * * *", "UTC", Utc::now()).unwrap_err();
        assert!(matches!(err, ScheduleError::Cron { .. }));
    }

    #[test]
    fn evaluates_in_the_task_timezone() {
        // 09:00 in Chisinau (EET, +02:00 in winter) is 07:00 UTC.
        let schedule = cron("0 9 * * *", "Europe/Chisinau");
        let fire = schedule.next_fire(utc("2024-01-10T00:00:00Z")).unwrap();
        assert_eq!(fire, utc("2024-01-10T07:00:00Z"));
    }

    #[test]
    fn spring_forward_slides_to_first_valid_local_time() {
        // P8. Chisinau springs forward on 2024-03-31: 03:00 EET jumps to
        // 04:00 EEST, so 03:00 local does not exist that day. The firing
        // slides to 04:00 EEST, which is 01:00 UTC.
        let schedule = cron("0 3 * * *", "Europe/Chisinau");

        // The day before, 03:00 EET is 01:00 UTC as usual.
        let before = schedule.next_fire(utc("2024-03-30T00:00:00Z")).unwrap();
        assert_eq!(before, utc("2024-03-30T01:00:00Z"));

        let transition_day = schedule.next_fire(before).unwrap();
        assert_eq!(transition_day, utc("2024-03-31T01:00:00Z"));

        // And the day after, 03:00 EEST is 00:00 UTC.
        let after = schedule.next_fire(transition_day).unwrap();
        assert_eq!(after, utc("2024-04-01T00:00:00Z"));
    }

    #[test]
    fn repeated_hour_fires_once_at_first_occurrence() {
        // Chisinau falls back on 2024-10-27: 04:00 EEST becomes 03:00 EET,
        // so 03:30 local happens twice. The schedule fires at the first
        // occurrence (EEST, +03:00 -> 00:30 UTC) and then not again until
        // the next day.
        let schedule = cron("30 3 * * *", "Europe/Chisinau");

        let fire = schedule.next_fire(utc("2024-10-27T00:00:00Z")).unwrap();
        assert_eq!(fire, utc("2024-10-27T00:30:00Z"));

        let next = schedule.next_fire(fire).unwrap();
        assert_eq!(next, utc("2024-10-28T01:30:00Z"));
    }
}
