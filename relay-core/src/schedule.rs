use chrono::{DateTime, Duration, FixedOffset, Timelike};
use thiserror::Error;

/// Sentinel stored in the registry for streams that start on the next tick.
pub const IMMEDIATE_SENTINEL: &str = "NOW";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule must be NOW or HH:MM, got {0:?}")]
    Format(String),
    #[error("hour must be 0-23, got {0}")]
    Hour(u32),
    #[error("minute must be 0-59, got {0}")]
    Minute(u32),
}

/// When a stream should leave `Waiting`: right away, or at a recurring
/// wall-clock time-of-day in the configured timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Immediate,
    At { hour: u32, minute: u32 },
}

impl Schedule {
    /// Parses the registry's display string. A trailing timezone label
    /// ("07:30 WIB") is tolerated and ignored.
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(IMMEDIATE_SENTINEL) {
            return Ok(Self::Immediate);
        }
        let clock = trimmed
            .split_whitespace()
            .next()
            .ok_or_else(|| ScheduleError::Format(raw.to_string()))?;
        let (hour, minute) = clock
            .split_once(':')
            .ok_or_else(|| ScheduleError::Format(raw.to_string()))?;
        let hour: u32 = hour
            .parse()
            .map_err(|_| ScheduleError::Format(raw.to_string()))?;
        let minute: u32 = minute
            .parse()
            .map_err(|_| ScheduleError::Format(raw.to_string()))?;
        if hour > 23 {
            return Err(ScheduleError::Hour(hour));
        }
        if minute > 59 {
            return Err(ScheduleError::Minute(minute));
        }
        Ok(Self::At { hour, minute })
    }

    /// Registry string form, e.g. "NOW" or "07:30 WIB".
    pub fn display(&self, timezone_label: &str) -> String {
        match self {
            Self::Immediate => IMMEDIATE_SENTINEL.to_string(),
            Self::At { hour, minute } => format!("{hour:02}:{minute:02} {timezone_label}"),
        }
    }
}

/// Decides whether a waiting stream is due at `now`.
///
/// Deliberately compares hour/minute only: a stored time-of-day recurs
/// daily and fires as soon as the clock is at or past it, regardless of
/// which calendar day the schedule was created on. Day rolling exists only
/// on the construction/display side ([`next_occurrence`]).
pub fn is_due(schedule: Schedule, now: DateTime<FixedOffset>) -> bool {
    match schedule {
        Schedule::Immediate => true,
        Schedule::At { hour, minute } => {
            now.hour() > hour || (now.hour() == hour && now.minute() >= minute)
        }
    }
}

/// The next wall-clock instant the schedule points at, for display and for
/// provider scheduling. A time-of-day at or before `now` targets tomorrow.
pub fn next_occurrence(schedule: Schedule, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    match schedule {
        Schedule::Immediate => now,
        Schedule::At { hour, minute } => {
            let target = now
                .with_hour(hour)
                .and_then(|t| t.with_minute(minute))
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            if target <= now {
                target + Duration::days(1)
            } else {
                target
            }
        }
    }
}

/// Human countdown shown next to waiting streams. Never used for the due
/// decision itself.
pub fn countdown(schedule: Schedule, now: DateTime<FixedOffset>) -> String {
    if schedule == Schedule::Immediate {
        return "Starting now...".to_string();
    }
    let seconds = (next_occurrence(schedule, now) - now).num_seconds();
    if seconds < 60 {
        "Starting soon...".to_string()
    } else if seconds < 3600 {
        format!("Will start in {} minutes", seconds / 60)
    } else {
        format!("Will start in {}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
