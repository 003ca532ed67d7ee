//! Next-run calculation for task schedules.
//!
//! Pure functions over an injected clock. Weekday numbering is ISO:
//! 0 = Monday .. 6 = Sunday, everywhere. All arithmetic is in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use thiserror::Error;

use showsync_types::Schedule;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid {field}: {value} (allowed 0..={max})")]
    InvalidField {
        field: &'static str,
        value: u32,
        max: u32,
    },
}

/// Compute the next trigger instant strictly after `now`.
///
/// Malformed schedule data fails closed — the caller must not arm a timer
/// from a defaulted value.
pub fn next_run(schedule: &Schedule, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    match schedule {
        Schedule::Daily { hour, minute } => {
            validate_time(*hour, *minute)?;
            let today = at_time(now.date_naive(), *hour, *minute);
            if today > now {
                Ok(today)
            } else {
                Ok(today + Duration::days(1))
            }
        }
        Schedule::Weekly {
            weekday,
            second_weekday,
            hour,
            minute,
        } => {
            validate_time(*hour, *minute)?;
            let first = next_weekly(*weekday, *hour, *minute, now)?;
            match second_weekday {
                Some(second) => {
                    let second = next_weekly(*second, *hour, *minute, now)?;
                    Ok(first.min(second))
                }
                None => Ok(first),
            }
        }
    }
}

/// Next occurrence of `weekday` (ISO, 0 = Monday) at `hour:minute` after `now`.
fn next_weekly(
    weekday: u8,
    hour: u32,
    minute: u32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    if weekday > 6 {
        return Err(ScheduleError::InvalidField {
            field: "weekday",
            value: weekday as u32,
            max: 6,
        });
    }

    let today_weekday = now.weekday().num_days_from_monday() as i64;
    let days_ahead = (weekday as i64 - today_weekday).rem_euclid(7);
    let candidate = at_time(now.date_naive() + Duration::days(days_ahead), hour, minute);
    if candidate > now {
        Ok(candidate)
    } else {
        Ok(candidate + Duration::days(7))
    }
}

fn validate_time(hour: u32, minute: u32) -> Result<(), ScheduleError> {
    if hour > 23 {
        return Err(ScheduleError::InvalidField {
            field: "hour",
            value: hour,
            max: 23,
        });
    }
    if minute > 59 {
        return Err(ScheduleError::InvalidField {
            field: "minute",
            value: minute,
            max: 59,
        });
    }
    Ok(())
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    // Validated by the caller; and_hms_opt cannot fail for in-range values
    date.and_hms_opt(hour, minute, 0)
        .expect("validated hour/minute")
        .and_utc()
}
