//! Rule refresh schedules: the `HOURLY`/`DAILY`/`WEEKLY`/`ONCE` vocabulary
//! plus an `every <n>m|h|d` interval form. A rule without a schedule is
//! manual-only.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AudienceError, AudienceResult};

/// Longest accepted `every` interval: one year.
pub const MAX_INTERVAL_MINUTES: i64 = 60 * 24 * 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Run once as soon as possible, then never again.
    Once,
    Every { minutes: i64 },
}

impl Schedule {
    pub const HOURLY: Schedule = Schedule::Every { minutes: 60 };
    pub const DAILY: Schedule = Schedule::Every { minutes: 60 * 24 };
    pub const WEEKLY: Schedule = Schedule::Every { minutes: 60 * 24 * 7 };

    /// Parse an optional schedule string. `None`, empty and `manual` mean
    /// manual-only.
    pub fn parse(raw: Option<&str>) -> AudienceResult<Option<Schedule>> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let upper = raw.to_ascii_uppercase();
        let schedule = match upper.as_str() {
            "MANUAL" | "NONE" => return Ok(None),
            "ONCE" => Schedule::Once,
            "HOURLY" => Schedule::HOURLY,
            "DAILY" => Schedule::DAILY,
            "WEEKLY" => Schedule::WEEKLY,
            _ => {
                let minutes = Self::parse_interval(&upper).ok_or_else(|| {
                    AudienceError::validation(format!("unrecognised schedule '{raw}'"))
                })?;
                if minutes > MAX_INTERVAL_MINUTES {
                    return Err(AudienceError::validation(format!(
                        "schedule '{raw}' is longer than {MAX_INTERVAL_MINUTES} minutes"
                    )));
                }
                Schedule::Every { minutes }
            }
        };
        Ok(Some(schedule))
    }

    /// Interval length in minutes, `None` when the string is not an
    /// `every <n>m|h|d` form. Overflowing amounts saturate and are caught by
    /// the length check.
    fn parse_interval(upper: &str) -> Option<i64> {
        let body = upper.strip_prefix("EVERY")?.trim();
        let (idx, unit) = body.char_indices().last()?;
        let amount: i64 = body[..idx].trim().parse().ok()?;
        if amount <= 0 {
            return None;
        }
        match unit {
            'M' => Some(amount),
            'H' => Some(amount.saturating_mul(60)),
            'D' => Some(amount.saturating_mul(60 * 24)),
            _ => None,
        }
    }

    /// First run time for a rule that was just scheduled.
    pub fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now
    }

    /// Next run after a run fired at `fired_at`. `None` once a one-shot
    /// schedule has fired, or when the next run is not representable.
    pub fn next_after(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => None,
            Schedule::Every { minutes } => TimeDelta::try_minutes(*minutes)
                .and_then(|interval| fired_at.checked_add_signed(interval)),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Schedule::Once => f.write_str("ONCE"),
            s if s == Schedule::HOURLY => f.write_str("HOURLY"),
            s if s == Schedule::DAILY => f.write_str("DAILY"),
            s if s == Schedule::WEEKLY => f.write_str("WEEKLY"),
            Schedule::Every { minutes } => write!(f, "every {minutes}m"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_keywords() {
        assert_eq!(Schedule::parse(Some("daily")).unwrap(), Some(Schedule::DAILY));
        assert_eq!(Schedule::parse(Some("HOURLY")).unwrap(), Some(Schedule::HOURLY));
        assert_eq!(Schedule::parse(Some("once")).unwrap(), Some(Schedule::Once));
        assert_eq!(Schedule::parse(None).unwrap(), None);
        assert_eq!(Schedule::parse(Some("  ")).unwrap(), None);
        assert_eq!(Schedule::parse(Some("manual")).unwrap(), None);
    }

    #[test]
    fn test_parse_intervals() {
        assert_eq!(
            Schedule::parse(Some("every 15m")).unwrap(),
            Some(Schedule::Every { minutes: 15 })
        );
        assert_eq!(
            Schedule::parse(Some("every 2d")).unwrap(),
            Some(Schedule::Every { minutes: 2880 })
        );
        assert!(Schedule::parse(Some("every 0h")).is_err());
        assert!(Schedule::parse(Some("fortnightly")).is_err());
    }

    #[test]
    fn test_interval_length_is_bounded() {
        assert_eq!(
            Schedule::parse(Some("every 366d")).unwrap(),
            Some(Schedule::Every { minutes: MAX_INTERVAL_MINUTES })
        );
        for raw in ["every 367d", "every 1000000000d", "every 9223372036854775807h"] {
            let err = Schedule::parse(Some(raw)).unwrap_err();
            assert!(matches!(err, AudienceError::Validation(_)), "{raw}: {err:?}");
        }
    }

    #[test]
    fn test_next_after_never_overflows() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(Schedule::Every { minutes: i64::MAX }.next_after(t), None);
        assert_eq!(Schedule::Every { minutes: 1_000_000_000 * 1440 }.next_after(t), None);
        assert_eq!(
            Schedule::Every { minutes: MAX_INTERVAL_MINUTES }.next_after(t),
            Some(t + TimeDelta::days(366))
        );
    }

    #[test]
    fn test_next_after() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            Schedule::HOURLY.next_after(t),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap())
        );
        assert_eq!(Schedule::Once.next_after(t), None);
        assert_eq!(Schedule::DAILY.to_string(), "DAILY");
        assert_eq!(Schedule::Every { minutes: 5 }.to_string(), "every 5m");
    }
}
