//! Cron expression handling.
//!
//! Schedules carry 5-field expressions bound to an IANA timezone. The parser
//! normalizes them by prepending a seconds field before handing them to the
//! `cron` crate, so `* * * * *` means "every minute at :00".

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use hive_types::{HiveError, HiveResult};

/// Parse a 5-field cron expression (6/7-field forms pass through).
pub fn parse_cron(expr: &str) -> HiveResult<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        _ => {
            return Err(HiveError::Validation(format!(
                "cron expression {expr:?} has {fields} fields, expected 5"
            )))
        }
    };
    Schedule::from_str(&normalized)
        .map_err(|e| HiveError::Validation(format!("bad cron expression {expr:?}: {e}")))
}

/// The first fire strictly after `after`, evaluated in `timezone`.
pub fn next_fire(expr: &str, timezone: &str, after: DateTime<Utc>) -> HiveResult<DateTime<Utc>> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| HiveError::Validation(format!("unknown timezone {timezone:?}")))?;
    let schedule = parse_cron(expr)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| HiveError::Validation(format!("cron expression {expr:?} never fires")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_forms_are_normalized() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("0 9 * * 1-5").is_ok());
        // Seconds-bearing forms pass through.
        assert!(parse_cron("30 0 9 * * *").is_ok());
    }

    #[test]
    fn malformed_expressions_are_validation_errors() {
        assert_eq!(parse_cron("* * *").unwrap_err().kind(), "validation");
        assert_eq!(parse_cron("not a cron at all wow").unwrap_err().kind(), "validation");
        assert_eq!(next_fire("* * * * *", "Mars/Olympus", Utc::now()).unwrap_err().kind(),
            "validation");
    }

    #[test]
    fn next_fire_is_strictly_later() {
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap();
        let next = next_fire("* * * * *", "UTC", after).unwrap();
        assert!(next > after);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 0).unwrap());

        // Advancing from the fire instant moves to the following minute.
        let after_next = next_fire("* * * * *", "UTC", next).unwrap();
        assert!(after_next > next);
    }

    #[test]
    fn timezone_binds_the_expression() {
        // 09:00 in Tokyo is 00:00 UTC.
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = next_fire("0 9 * * *", "Asia/Tokyo", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
    }
}
