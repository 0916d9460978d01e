//! Periodic maintenance-window evaluation.
//!
//! A reboot window recurs daily (`"02:00"`) or weekly (`"Thu 02:00"`), always
//! in UTC, with a length like `"1h"` or `"90m"`. New reboots are only
//! admitted while the current time falls inside
//! `[previous_start, previous_start + length)`. When no window is configured
//! admission is allowed at any time.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};

use crate::error::{Error, Result};

/// A recurring window during which reboots may begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootWindow {
    /// Day the window starts on; `None` means the window recurs daily.
    start_day: Option<Weekday>,
    start_time: NaiveTime,
    length: Duration,
}

impl RebootWindow {
    /// Parse a window from a start expression and a length.
    ///
    /// The start expression is `"HH:MM"` or `"<weekday> HH:MM"` (weekday
    /// names may be abbreviated, any case). The length uses humantime
    /// grammar, must be positive, and must not exceed the recurrence period.
    /// Malformed input is a configuration error; callers treat it as fatal
    /// at startup.
    pub fn parse(start: &str, length: &str) -> Result<Self> {
        let tokens = start.split_whitespace().collect::<Vec<_>>();
        let (start_day, time) = match tokens[..] {
            [time] => (None, time),
            [day, time] => {
                let day = day.parse::<Weekday>().map_err(|_| {
                    Error::Config(format!("invalid weekday in reboot window start: {day:?}"))
                })?;
                (Some(day), time)
            }
            _ => {
                return Err(Error::Config(format!(
                    "reboot window start must be \"HH:MM\" or \"<weekday> HH:MM\", got {start:?}"
                )))
            }
        };

        let start_time = NaiveTime::parse_from_str(time, "%H:%M").map_err(|e| {
            Error::Config(format!("invalid time in reboot window start {time:?}: {e}"))
        })?;

        let std_length = humantime::parse_duration(length)
            .map_err(|e| Error::Config(format!("invalid reboot window length {length:?}: {e}")))?;
        let length = Duration::from_std(std_length)
            .map_err(|e| Error::Config(format!("reboot window length out of range: {e}")))?;

        let window = Self {
            start_day,
            start_time,
            length,
        };

        if length <= Duration::zero() {
            return Err(Error::Config(
                "reboot window length must be positive".to_string(),
            ));
        }
        if length > window.period() {
            return Err(Error::Config(format!(
                "reboot window length {length} exceeds its recurrence period; \
                 windows must not overlap"
            )));
        }

        Ok(window)
    }

    fn period(&self) -> Duration {
        match self.start_day {
            Some(_) => Duration::days(7),
            None => Duration::days(1),
        }
    }

    /// Start of the most recent window occurrence at or before `now`.
    pub fn previous(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let date = match self.start_day {
            None => today,
            Some(day) => {
                let offset =
                    (today.weekday().num_days_from_sunday() + 7 - day.num_days_from_sunday()) % 7;
                today - Duration::days(offset.into())
            }
        };

        let mut start = date.and_time(self.start_time).and_utc();
        if start > now {
            start -= self.period();
        }
        start
    }

    /// Start of the next window occurrence after [`Self::previous`].
    pub fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.previous(now) + self.period()
    }

    /// Whether `now` falls inside the current window occurrence.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now < self.previous(now) + self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2024-05-02 is a Thursday.
    fn at(day: u32, hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, min, 0).unwrap()
    }

    #[test]
    fn parses_daily_and_weekly_starts() {
        let daily = RebootWindow::parse("02:00", "1h").unwrap();
        assert_eq!(daily.period(), Duration::days(1));

        for start in ["Thu 02:00", "thu 02:00", "Thursday 02:00"] {
            let weekly = RebootWindow::parse(start, "1h").unwrap();
            assert_eq!(weekly.period(), Duration::days(7));
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for (start, length) in [
            ("never", "1h"),
            ("Thu 02:00 extra", "1h"),
            ("Someday 02:00", "1h"),
            ("02:00", "soon"),
            ("02:00", "0s"),
            ("02:00", "25h"),
            ("Thu 02:00", "8d"),
        ] {
            let err = RebootWindow::parse(start, length).unwrap_err();
            assert!(
                matches!(err, Error::Config(_)),
                "expected config error for ({start:?}, {length:?})"
            );
        }
    }

    #[test]
    fn length_equal_to_period_is_allowed() {
        assert!(RebootWindow::parse("02:00", "24h").is_ok());
        assert!(RebootWindow::parse("Thu 02:00", "7d").is_ok());
    }

    #[test]
    fn daily_window_boundaries() {
        let window = RebootWindow::parse("02:00", "1h").unwrap();

        assert!(!window.contains(at(2, 1, 59)));
        assert!(window.contains(at(2, 2, 0)));
        assert!(window.contains(at(2, 2, 59)));
        assert!(!window.contains(at(2, 3, 0)));
    }

    #[test]
    fn previous_rolls_back_before_todays_start() {
        let window = RebootWindow::parse("02:00", "1h").unwrap();

        assert_eq!(window.previous(at(2, 1, 0)), at(1, 2, 0));
        assert_eq!(window.previous(at(2, 12, 0)), at(2, 2, 0));
        assert_eq!(window.next(at(2, 12, 0)), at(3, 2, 0));
    }

    #[test]
    fn weekly_window_matches_its_day_only() {
        let window = RebootWindow::parse("Thu 02:00", "1h").unwrap();

        // Thursday inside the hour.
        assert!(window.contains(at(2, 2, 30)));
        // Friday at the same hour: the Thursday window closed long ago.
        assert!(!window.contains(at(3, 2, 30)));
        // Wednesday before the window: previous occurrence is last Thursday.
        assert_eq!(window.previous(at(1, 10, 0)), at(2, 2, 0) - Duration::days(7));
        assert_eq!(window.next(at(1, 10, 0)), at(2, 2, 0));
    }

    #[test]
    fn weekly_window_spanning_midnight() {
        let window = RebootWindow::parse("Thu 23:30", "2h").unwrap();

        // Early Friday is still inside Thursday night's window.
        assert!(window.contains(at(3, 0, 30)));
        assert!(!window.contains(at(3, 1, 30)));
    }
}
