//! Cycle scheduling
//!
//! Computes how long the daemon sleeps between cycles. Interval mode is a
//! plain duration; daily/weekly/monthly modes target the next wall-clock
//! occurrence in local time.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, Weekday};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Fallback when an interval string does not parse.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown update mode {0:?} (expected INTERVAL, DAILY, WEEKLY or MONTHLY)")]
    UnknownMode(String),
    #[error("invalid time {0:?} (expected HH:MM)")]
    InvalidTime(String),
    #[error("invalid day {0:?} (expected a weekday name or a day of month)")]
    InvalidDay(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateMode {
    Interval(Duration),
    Daily(NaiveTime),
    Weekly(Weekday, NaiveTime),
    Monthly(u32, NaiveTime),
}

impl UpdateMode {
    /// Build a mode from the raw environment surface. `interval` is only
    /// consulted in interval mode, `time` and `day` only in the calendar
    /// modes.
    pub fn from_settings(
        mode: &str,
        interval: &str,
        time: &str,
        day: &str,
    ) -> Result<Self, ScheduleError> {
        match mode.to_ascii_uppercase().as_str() {
            "INTERVAL" => Ok(UpdateMode::Interval(parse_interval(interval))),
            "DAILY" => Ok(UpdateMode::Daily(parse_time(time)?)),
            "WEEKLY" => {
                let weekday = parse_weekday(day)
                    .ok_or_else(|| ScheduleError::InvalidDay(day.to_string()))?;
                Ok(UpdateMode::Weekly(weekday, parse_time(time)?))
            }
            "MONTHLY" => {
                let day_of_month: u32 = day
                    .parse()
                    .map_err(|_| ScheduleError::InvalidDay(day.to_string()))?;
                // 29..31 would skip months of different lengths.
                Ok(UpdateMode::Monthly(day_of_month.clamp(1, 28), parse_time(time)?))
            }
            other => Err(ScheduleError::UnknownMode(other.to_string())),
        }
    }

    /// Delay until the next cycle, measured from the current local time.
    pub fn delay_from_now(&self) -> Duration {
        self.next_delay(Local::now())
    }

    /// Delay until the next cycle, measured from `now`. Always strictly
    /// positive.
    pub fn next_delay(&self, now: DateTime<Local>) -> Duration {
        match self {
            UpdateMode::Interval(d) => *d,
            _ => {
                let now = now.naive_local();
                let fire = self.next_fire(now);
                (fire - now).to_std().unwrap_or(Duration::from_secs(1))
            }
        }
    }

    /// The next matching wall-clock instant after `now` for the calendar
    /// modes. Interval mode never reaches this.
    fn next_fire(&self, now: NaiveDateTime) -> NaiveDateTime {
        match self {
            UpdateMode::Interval(d) => now + ChronoDuration::from_std(*d).unwrap_or_default(),
            UpdateMode::Daily(time) => {
                let today = now.date().and_time(*time);
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
            UpdateMode::Weekly(weekday, time) => {
                let days_ahead = (weekday.num_days_from_monday() + 7
                    - now.weekday().num_days_from_monday())
                    % 7;
                let candidate = (now.date() + ChronoDuration::days(days_ahead as i64)).and_time(*time);
                if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(7)
                }
            }
            UpdateMode::Monthly(day, time) => {
                let this_month = now
                    .date()
                    .with_day(*day)
                    .expect("day of month is clamped to 1..=28")
                    .and_time(*time);
                if this_month > now {
                    this_month
                } else {
                    let (year, month) = if now.month() == 12 {
                        (now.year() + 1, 1)
                    } else {
                        (now.year(), now.month() + 1)
                    };
                    this_month
                        .date()
                        .with_year(year)
                        .and_then(|d| d.with_month(month))
                        .expect("day 1..=28 exists in every month")
                        .and_time(*time)
                }
            }
        }
    }
}

/// Durations like `30s`, `10m`, `2h`, `1d` (suffix case-insensitive, bare
/// numbers are seconds). Malformed input falls back to ten minutes, the
/// floor is one second.
pub fn parse_interval(s: &str) -> Duration {
    let parsed = match s.trim() {
        "" => None,
        trimmed => {
            let (value, unit) = match trimmed.chars().last() {
                Some(c) if c.is_ascii_alphabetic() => {
                    (&trimmed[..trimmed.len() - 1], c.to_ascii_lowercase())
                }
                _ => (trimmed, 's'),
            };
            value.parse::<u64>().ok().and_then(|n| match unit {
                's' => Some(Duration::from_secs(n)),
                'm' => Some(Duration::from_secs(n * 60)),
                'h' => Some(Duration::from_secs(n * 60 * 60)),
                'd' => Some(Duration::from_secs(n * 24 * 60 * 60)),
                _ => None,
            })
        }
    };
    match parsed {
        Some(d) => d.max(Duration::from_secs(1)),
        None => {
            warn!(interval = s, "unparseable update interval, using 10m");
            DEFAULT_INTERVAL
        }
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| ScheduleError::InvalidTime(s.to_string()))
}

/// Weekday names (`monday`, `mon`) or ISO numbers (1 = Monday .. 7 =
/// Sunday), so the shared day setting works for weekly and monthly modes.
fn parse_weekday(day: &str) -> Option<Weekday> {
    if let Ok(weekday) = Weekday::from_str(&day.to_ascii_lowercase()) {
        return Some(weekday);
    }
    match day.parse::<u8>().ok()? {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        7 => Some(Weekday::Sun),
        _ => None,
    }
}
