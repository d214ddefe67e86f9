//! RFC-5545 recurrence rules.
//!
//! Expressions either carry their own `DTSTART` (in which case they are
//! parsed verbatim) or consist of the rule part alone, in which case the
//! anchor instant supplied at parse time becomes the `DTSTART`, expressed in
//! the task's timezone.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::ScheduleError;

pub(crate) fn parse(
    expression: &str,
    tz: Tz,
    anchor: DateTime<Utc>,
) -> Result<RRuleSet, ScheduleError> {
    let source = if expression.contains("DTSTART") {
        expression.to_string()
    } else {
        let rule = expression.strip_prefix("RRULE:").unwrap_or(expression);
        let dtstart = anchor.with_timezone(&tz);
        format!(
            "DTSTART;TZID={}:{}\nRRULE:{}",
            tz.name(),
            dtstart.format("%Y%m%dT%H%M%S"),
            rule
        )
    };

    source.parse::<RRuleSet>().map_err(|e| ScheduleError::Rrule {
        expr: expression.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn next_fire(set: &RRuleSet, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // `after` on the rule set is an inclusive range bound; nudge past it and
    // filter to keep the "strictly after" contract exact.
    let cutoff = (after + Duration::seconds(1)).with_timezone(&rrule::Tz::UTC);
    let result = set.clone().after(cutoff).all(8);

    result
        .dates
        .into_iter()
        .map(|d| d.with_timezone(&Utc))
        .find(|d| *d > after)
}
