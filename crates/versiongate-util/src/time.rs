//! Time utilities for versiongate
//!
//! All persisted timestamps are UTC. User-facing reminder times are entered
//! as a local date and wall-clock time and converted with the user's fixed
//! UTC offset (in minutes).
//!
//! # Mock Time for Development
//!
//! In debug builds, the `VERSIONGATE_MOCK_TIME` environment variable can be
//! set to override the system time. The mocked clock advances at the same
//! rate as the real one.
//!
//! Format: `YYYY-MM-DD HH:MM:SS`, interpreted as UTC.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::sync::OnceLock;
use thiserror::Error;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "VERSIONGATE_MOCK_TIME";

/// Layout of the configured deadline: `deadline_date + " " + cutoff_time`
pub const DEADLINE_LAYOUT: &str = "%m-%d-%Y %H:%M";

/// Layout of a reminder date as entered by the user
pub const REMINDER_DATE_LAYOUT: &str = "%Y-%m-%d";

/// Layout of a reminder wall-clock time as entered by the user
pub const REMINDER_TIME_LAYOUT: &str = "%H:%M";

/// Offsets beyond +/- 18 hours are rejected
const MAX_OFFSET_MINUTES: i64 = 18 * 60;

/// Time parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("Invalid date '{value}': expected {layout}")]
    InvalidDate { value: String, layout: &'static str },

    #[error("Invalid time '{value}': expected {layout}")]
    InvalidTime { value: String, layout: &'static str },

    #[error("Invalid deadline '{value}': expected {layout}")]
    InvalidDeadline { value: String, layout: &'static str },

    #[error("UTC offset out of range: {0} minutes")]
    OffsetOutOfRange(i64),
}

static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // wraps Utc::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(mock_time_str) = std::env::var(MOCK_TIME_ENV_VAR) {
                match NaiveDateTime::parse_from_str(&mock_time_str, "%Y-%m-%d %H:%M:%S") {
                    Ok(naive_dt) => {
                        let offset = naive_dt.and_utc().signed_duration_since(Utc::now());
                        tracing::info!(
                            mock_time = %mock_time_str,
                            offset_secs = offset.num_seconds(),
                            "Mock time enabled"
                        );
                        return Some(offset);
                    }
                    Err(_) => {
                        tracing::warn!(
                            mock_time = %mock_time_str,
                            expected_format = "%Y-%m-%d %H:%M:%S",
                            "Invalid mock time format"
                        );
                    }
                }
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Current UTC time, respecting mock time in debug builds.
#[allow(clippy::disallowed_methods)]
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();
    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Build a fixed offset from minutes east of UTC
pub fn fixed_offset(tz_offset_minutes: i64) -> Result<FixedOffset, TimeError> {
    if tz_offset_minutes.abs() > MAX_OFFSET_MINUTES {
        return Err(TimeError::OffsetOutOfRange(tz_offset_minutes));
    }
    FixedOffset::east_opt((tz_offset_minutes * 60) as i32)
        .ok_or(TimeError::OffsetOutOfRange(tz_offset_minutes))
}

fn parse_reminder_date(date: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(date.trim(), REMINDER_DATE_LAYOUT).map_err(|_| TimeError::InvalidDate {
        value: date.to_string(),
        layout: REMINDER_DATE_LAYOUT,
    })
}

fn parse_reminder_time(time: &str) -> Result<NaiveTime, TimeError> {
    let time = time.trim();
    NaiveTime::parse_from_str(time, REMINDER_TIME_LAYOUT)
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
        .map_err(|_| TimeError::InvalidTime {
            value: time.to_string(),
            layout: REMINDER_TIME_LAYOUT,
        })
}

/// Reconstruct the UTC instant of a user's local reminder.
///
/// `date` is `YYYY-MM-DD`, `time` is `HH:MM`, and the offset is minutes
/// east of UTC.
pub fn local_due(tz_offset_minutes: i64, date: &str, time: &str) -> Result<DateTime<Utc>, TimeError> {
    let offset = fixed_offset(tz_offset_minutes)?;
    let naive = parse_reminder_date(date)?.and_time(parse_reminder_time(time)?);

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| TimeError::InvalidTime {
            value: time.to_string(),
            layout: REMINDER_TIME_LAYOUT,
        })
}

/// Signed distance from `now` to a user's local reminder moment.
pub fn locale_diff(
    tz_offset_minutes: i64,
    date: &str,
    time: &str,
    now: DateTime<Utc>,
) -> Result<chrono::Duration, TimeError> {
    Ok(local_due(tz_offset_minutes, date, time)? - now)
}

/// Compose the enforcement deadline from `MM-DD-YYYY` and `HH:MM`.
pub fn parse_deadline(deadline_date: &str, cutoff_time: &str) -> Result<DateTime<Utc>, TimeError> {
    let composed = format!("{} {}", deadline_date.trim(), cutoff_time.trim());
    NaiveDateTime::parse_from_str(&composed, DEADLINE_LAYOUT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TimeError::InvalidDeadline {
            value: composed,
            layout: DEADLINE_LAYOUT,
        })
}

/// Current wall-clock time for a user at the given offset
pub fn user_now(tz_offset_minutes: i64) -> Result<DateTime<FixedOffset>, TimeError> {
    Ok(now().with_timezone(&fixed_offset(tz_offset_minutes)?))
}

/// Format a timestamp for human-facing messages, in the user's offset
pub fn format_for_user(dt: &DateTime<Utc>, tz_offset_minutes: i64) -> String {
    match fixed_offset(tz_offset_minutes) {
        Ok(offset) => dt
            .with_timezone(&offset)
            .format("%A, %B %-d, %Y %-I:%M %p")
            .to_string(),
        Err(_) => dt.format("%A, %B %-d, %Y %-I:%M %p UTC").to_string(),
    }
}

/// Absolute value of a signed chrono duration as std duration
pub fn abs_duration(d: chrono::Duration) -> std::time::Duration {
    let magnitude = if d < chrono::Duration::zero() { -d } else { d };
    magnitude.to_std().unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_local_due_utc() {
        let due = local_due(0, "2024-05-04", "17:05").unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2024, 5, 4, 17, 5, 0).unwrap());
    }

    #[test]
    fn test_local_due_applies_offset() {
        // 09:00 at UTC-5 is 14:00 UTC
        let due = local_due(-300, "2024-05-04", "09:00").unwrap();
        assert_eq!(due.hour(), 14);

        // 09:00 at UTC+5:30 is 03:30 UTC
        let due = local_due(330, "2024-05-04", "09:00").unwrap();
        assert_eq!((due.hour(), due.minute()), (3, 30));
    }

    #[test]
    fn test_local_due_rejects_garbage() {
        assert!(matches!(
            local_due(0, "05/04/2024", "09:00"),
            Err(TimeError::InvalidDate { .. })
        ));
        assert!(matches!(
            local_due(0, "2024-05-04", "9am"),
            Err(TimeError::InvalidTime { .. })
        ));
        assert!(matches!(
            local_due(24 * 60, "2024-05-04", "09:00"),
            Err(TimeError::OffsetOutOfRange(_))
        ));
    }

    #[test]
    fn test_locale_diff_sign() {
        let now = Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap();
        let ahead = locale_diff(0, "2024-05-04", "12:04", now).unwrap();
        assert_eq!(ahead.num_minutes(), 4);
        let behind = locale_diff(0, "2024-05-04", "11:50", now).unwrap();
        assert_eq!(behind.num_minutes(), -10);
        assert_eq!(abs_duration(behind).as_secs(), 600);
    }

    #[test]
    fn test_parse_deadline() {
        let deadline = parse_deadline("01-02-2024", "08:00").unwrap();
        assert_eq!(deadline, Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_deadline_invalid() {
        assert!(parse_deadline("2024-01-02", "08:00").is_err());
        assert!(parse_deadline("01-02-2024", "").is_err());
        assert!(parse_deadline("13-40-2024", "08:00").is_err());
    }

    #[test]
    fn test_format_for_user() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 0).unwrap();
        assert_eq!(format_for_user(&dt, 0), "Tuesday, January 2, 2024 3:04 PM");
    }

    #[test]
    fn test_mock_time_env_var_name() {
        assert_eq!(MOCK_TIME_ENV_VAR, "VERSIONGATE_MOCK_TIME");
    }

    #[test]
    fn test_now_returns_time() {
        let before = Utc::now();
        let t = now();
        if !is_mock_time_active() {
            assert!(t >= before);
        }
    }
}
