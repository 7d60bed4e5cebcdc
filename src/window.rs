use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("Invalid time `{0}` (use HH:MM)")]
    InvalidTime(String),
    #[error("Folder rollover hour must be 0-23, got {0}")]
    InvalidRolloverHour(u32),
}

/// Parses a 24-hour `HH:MM` string.
pub fn parse_hhmm(value: &str) -> Result<NaiveTime, WindowError> {
    let invalid = || WindowError::InvalidTime(value.to_string());

    let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

pub fn format_hhmm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

/// Drops seconds and sub-seconds.
pub fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

/// The daily span in which capturing is allowed.
///
/// An `end` earlier than `start` wraps past midnight. Equal values describe an empty window that
/// is never active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub folder_rollover_hour: u32,
}

impl ScheduleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime, folder_rollover_hour: u32) -> Self {
        Self {
            start: truncate_to_minute(start),
            end: truncate_to_minute(end),
            folder_rollover_hour,
        }
    }

    pub fn parse(start: &str, end: &str, folder_rollover_hour: u32) -> Result<Self, WindowError> {
        if folder_rollover_hour > 23 {
            return Err(WindowError::InvalidRolloverHour(folder_rollover_hour));
        }
        Ok(Self::new(
            parse_hhmm(start)?,
            parse_hhmm(end)?,
            folder_rollover_hour,
        ))
    }

    pub fn is_overnight(&self) -> bool {
        self.end < self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Whether `time` falls inside the window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.is_empty() {
            false
        } else if self.is_overnight() {
            time >= self.start || time < self.end
        } else {
            self.start <= time && time < self.end
        }
    }

    /// How long to wait from `now` until the window next opens, or `None` when it is open now.
    pub fn time_until_start(&self, now: NaiveDateTime) -> Option<Duration> {
        if self.contains(now.time()) {
            return None;
        }

        let today_start = now.date().and_time(self.start);
        let next_start = if today_start > now {
            today_start
        } else {
            today_start + Duration::days(1)
        };

        Some(next_start - now)
    }

    /// The instant a session running at `now` has to end.
    ///
    /// Anchored to `now`, so a session that starts exactly at midnight on an overnight schedule
    /// still ends on the correct following morning.
    pub fn session_end(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today_end = now.date().and_time(self.end);
        let current = now.time();

        let ends_tomorrow = if self.is_overnight() {
            current >= self.start
        } else {
            current >= self.end
        };

        if ends_tomorrow {
            today_end + Duration::days(1)
        } else {
            today_end
        }
    }

    /// The date whose folder a capture taken at `now` belongs to.
    pub fn bucket_date(&self, now: NaiveDateTime) -> NaiveDate {
        bucket_date(now, self.folder_rollover_hour)
    }
}

/// Before the rollover hour captures still belong to the previous day's folder.
pub fn bucket_date(now: NaiveDateTime, folder_rollover_hour: u32) -> NaiveDate {
    let date = now.date();
    if now.hour() < folder_rollover_hour {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// `YYYYMMDD`, used for session keys and snapshot folder names.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, "%Y%m%d").ok()
}

/// `YYYYMMDD-HHMMSS.jpg`
pub fn snapshot_file_name(at: NaiveDateTime) -> String {
    at.format("%Y%m%d-%H%M%S.jpg").to_string()
}
