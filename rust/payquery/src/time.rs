//! Time utilities for resolving descriptor time ranges and presets to absolute bounds.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePreset {
    RelativeHours(i64),
    RelativeDays(i64),
    RelativeWeeks(i64),
    RelativeMonths(u32),
    Today,
    Yesterday,
    ThisMonth,
    LastMonth,
}

impl TimePreset {
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<TimeBounds> {
        let bounds = match self {
            TimePreset::RelativeHours(hours) => TimeBounds {
                start: now.checked_sub_signed(Duration::try_hours(*hours)?)?,
                end: now,
            },
            TimePreset::RelativeDays(days) => TimeBounds {
                start: now.checked_sub_signed(Duration::try_days(*days)?)?,
                end: now,
            },
            TimePreset::RelativeWeeks(weeks) => TimeBounds {
                start: now.checked_sub_signed(Duration::try_weeks(*weeks)?)?,
                end: now,
            },
            TimePreset::RelativeMonths(months) => TimeBounds {
                start: now.checked_sub_months(Months::new(*months))?,
                end: now,
            },
            TimePreset::Today => TimeBounds {
                start: start_of_day(now.date_naive())?,
                end: now,
            },
            TimePreset::Yesterday => {
                let today = now.date_naive();
                TimeBounds {
                    start: start_of_day(today.pred_opt()?)?,
                    end: start_of_day(today)?,
                }
            }
            TimePreset::ThisMonth => TimeBounds {
                start: start_of_day(now.date_naive().with_day(1)?)?,
                end: now,
            },
            TimePreset::LastMonth => {
                let first_of_this = now.date_naive().with_day(1)?;
                let first_of_last = first_of_this.checked_sub_months(Months::new(1))?;
                TimeBounds {
                    start: start_of_day(first_of_last)?,
                    end: start_of_day(first_of_this)?,
                }
            }
        };
        Some(bounds)
    }
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Parses preset tokens such as `last_3_months`, `last_90d`, `24h`, `today`.
pub fn parse_preset(raw: &str) -> Option<TimePreset> {
    let value = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_lowercase();

    match value.as_str() {
        "today" => return Some(TimePreset::Today),
        "yesterday" => return Some(TimePreset::Yesterday),
        "this_month" | "thismonth" => return Some(TimePreset::ThisMonth),
        "last_month" | "lastmonth" | "previous_month" => return Some(TimePreset::LastMonth),
        _ => {}
    }

    let normalized = value.replace(['_', '-', ' '], "");
    let stripped = normalized.strip_prefix("last").unwrap_or(&normalized);
    parse_numeric_suffix(stripped)
}

fn parse_numeric_suffix(value: &str) -> Option<TimePreset> {
    let split = value.find(|ch: char| !ch.is_ascii_digit())?;
    let (digits, suffix) = value.split_at(split);
    let amount: i64 = digits.parse().ok()?;
    if amount <= 0 {
        return None;
    }

    match suffix {
        "h" | "hour" | "hours" => Some(TimePreset::RelativeHours(amount)),
        "d" | "day" | "days" => Some(TimePreset::RelativeDays(amount)),
        "w" | "week" | "weeks" => Some(TimePreset::RelativeWeeks(amount)),
        "m" | "mo" | "month" | "months" => {
            u32::try_from(amount).ok().map(TimePreset::RelativeMonths)
        }
        _ => None,
    }
}

/// Parses an absolute timestamp literal: RFC 3339, `YYYY-MM-DD HH:MM:SS`, or a bare date.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(start_of_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn oversized_relative_presets_do_not_resolve() {
        let now = Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap();
        for raw in ["last_100000000d", "last_9223372036854775807h", "last_99999999999w", "last_4000000000months"] {
            let preset = parse_preset(raw).unwrap();
            assert_eq!(preset.resolve(now), None, "{raw} should not resolve");
        }
        assert!(parse_preset("last_36500d").unwrap().resolve(now).is_some());
    }

    #[test]
    fn parses_relative_presets() {
        assert_eq!(parse_preset("last_7d"), Some(TimePreset::RelativeDays(7)));
        assert_eq!(parse_preset("24h"), Some(TimePreset::RelativeHours(24)));
        assert_eq!(
            parse_preset("last_3_months"),
            Some(TimePreset::RelativeMonths(3))
        );
        assert_eq!(parse_preset("last 2 weeks"), Some(TimePreset::RelativeWeeks(2)));
        assert_eq!(parse_preset("last_0d"), None);
        assert_eq!(parse_preset("someday"), None);
    }

    #[test]
    fn relative_months_use_calendar_arithmetic() {
        let now = at("2025-05-31T12:00:00Z");
        let bounds = TimePreset::RelativeMonths(3).resolve(now).unwrap();
        assert_eq!(bounds.start, at("2025-02-28T12:00:00Z"));
        assert_eq!(bounds.end, now);
    }

    #[test]
    fn last_month_covers_the_previous_calendar_month() {
        let now = at("2025-03-15T08:30:00Z");
        let bounds = TimePreset::LastMonth.resolve(now).unwrap();
        assert_eq!(bounds.start, at("2025-02-01T00:00:00Z"));
        assert_eq!(bounds.end, at("2025-03-01T00:00:00Z"));
    }

    #[test]
    fn yesterday_ends_at_midnight() {
        let now = at("2025-01-02T10:00:00Z");
        let bounds = TimePreset::Yesterday.resolve(now).unwrap();
        assert_eq!(bounds.start, at("2025-01-01T00:00:00Z"));
        assert_eq!(bounds.end, at("2025-01-02T00:00:00Z"));
    }

    #[test]
    fn parses_absolute_literals() {
        assert_eq!(
            parse_datetime("2025-01-01 09:00:00"),
            Some(at("2025-01-01T09:00:00Z"))
        );
        assert_eq!(parse_datetime("2025-01-01"), Some(at("2025-01-01T00:00:00Z")));
        assert_eq!(
            parse_datetime("2025-01-01T09:00:00+09:00"),
            Some(at("2025-01-01T00:00:00Z"))
        );
        assert_eq!(parse_datetime("next tuesday"), None);
    }
}
