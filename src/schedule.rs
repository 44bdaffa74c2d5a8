/*!
 # Daily schedule validation and evaluation

 This module provides the per-channel scheduling logic: a daily on/off
 window with minute granularity, validated once at the boundary and then
 evaluated on every scheduler tick.

 A window is treated as the half-open interval `[start, end)`. Windows with
 `start > end` wrap past midnight, so `22:00`–`06:00` is on late in the
 evening and off at six in the morning.
*/

use std::fmt;

use thiserror::Error;

/// Validation failures for a schedule window.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// All four time fields are zero, the "never touched" state
    #[error("schedule start and end times are not set")]
    Unset,

    /// Start and end name the same minute
    #[error("schedule start and end cannot be the same time")]
    SameTime,

    /// An hour or minute field is outside its valid range
    #[error("schedule time out of range (hours 0-23, minutes 0-59)")]
    OutOfRange,
}

/// A wall-clock time with minute granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    /// Hour, 0-23
    pub hour: u8,
    /// Minute, 0-59
    pub minute: u8,
}

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Self {
        TimeOfDay { hour, minute }
    }

    /// Minutes since midnight.
    fn minute_of_day(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }

    fn in_range(self) -> bool {
        self.hour <= 23 && self.minute <= 59
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Operator-visible scheduling status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No enabled schedule
    #[default]
    Unset,
    /// Schedule enabled, outside the window
    Armed,
    /// Schedule enabled, inside the window
    Active,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Unset => write!(f, "unset"),
            Phase::Armed => write!(f, "armed"),
            Phase::Active => write!(f, "active"),
        }
    }
}

/// A daily on/off window as entered by the operator.
///
/// The times are unconstrained here; [`validate`] is the gate a schedule
/// must pass before `enabled` may take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub enabled: bool,
}

impl Schedule {
    /// A disabled schedule with zeroed times, the state of a freshly
    /// created or cleared channel.
    pub fn unset() -> Self {
        Schedule {
            start: TimeOfDay::MIDNIGHT,
            end: TimeOfDay::MIDNIGHT,
            enabled: false,
        }
    }

    /// Forces `enabled` off, keeping the entered times.
    pub fn disabled(self) -> Self {
        Schedule {
            enabled: false,
            ..self
        }
    }
}

/// Proof that a schedule's window passed [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidSchedule {
    start: TimeOfDay,
    end: TimeOfDay,
}

impl ValidSchedule {
    pub fn start(&self) -> TimeOfDay {
        self.start
    }

    pub fn end(&self) -> TimeOfDay {
        self.end
    }

    /// Whether `now` falls inside the half-open window `[start, end)`,
    /// wrapping past midnight when `start > end`.
    pub fn contains(&self, now: TimeOfDay) -> bool {
        let start = self.start.minute_of_day();
        let end = self.end.minute_of_day();
        let now = now.minute_of_day();
        if start < end {
            start <= now && now < end
        } else {
            now >= start || now < end
        }
    }
}

/// Checks a schedule window before it may be armed.
///
/// The checks run in the order the operator expects: an all-zero window is
/// reported as not set before the same-time rule fires on it, and range
/// errors come last.
pub fn validate(schedule: &Schedule) -> Result<ValidSchedule, ScheduleError> {
    let (start, end) = (schedule.start, schedule.end);
    if start == TimeOfDay::MIDNIGHT && end == TimeOfDay::MIDNIGHT {
        return Err(ScheduleError::Unset);
    }
    if start == end {
        return Err(ScheduleError::SameTime);
    }
    if !start.in_range() || !end.in_range() {
        return Err(ScheduleError::OutOfRange);
    }
    Ok(ValidSchedule { start, end })
}

/// Evaluates a validated schedule at `now`.
///
/// Returns the new phase and the desired on/off state. The result depends
/// only on the inputs, so repeated evaluation with an unchanged clock is a
/// no-op for the caller.
pub fn evaluate(now: TimeOfDay, schedule: &ValidSchedule) -> (Phase, bool) {
    let desired_on = schedule.contains(now);
    let phase = if desired_on { Phase::Active } else { Phase::Armed };
    (phase, desired_on)
}
