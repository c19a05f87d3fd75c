//! Time-slot keys for idempotent self-rescheduling.
//!
//! A recurring job reschedules itself with a key that names the *target* slot
//! of its next run. Two schedule calls aimed at the same slot (a retry, two
//! instances racing, a re-entrant handler) produce the same key, and the queue
//! collapses them into one pending occurrence.

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::schedule::{format_date_key, format_minute_key};

/// Idempotency key identifying one scheduled occurrence of a job.
///
/// Keys are always prefixed with the job name, so equal slots of different
/// jobs never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    /// Slot aligned to a wall-clock minute: `<job>:<YYYYMMDD-HHMM>`.
    pub fn minute<Tz: TimeZone>(job: &str, at: &DateTime<Tz>) -> Self {
        Self(format!("{job}:{}", format_minute_key(at)))
    }

    /// Slot aligned to a calendar day: `<job>:<YYYY-MM-DD>`.
    pub fn daily<Tz: TimeZone>(job: &str, at: &DateTime<Tz>) -> Self {
        Self(format!("{job}:{}", format_date_key(at)))
    }

    /// Slot at an exact instant: `<job>:next:<unix-seconds>`.
    pub fn next_at<Tz: TimeZone>(job: &str, at: &DateTime<Tz>) -> Self {
        Self(format!("{job}:next:{}", at.timestamp()))
    }

    /// Slot of the occurrence that follows the one planned for `previous`:
    /// `<job>:after:<unix-seconds>`.
    ///
    /// Every replay of that occurrence derives the same key, whatever delay it
    /// picks for the next run.
    pub fn after<Tz: TimeZone>(job: &str, previous: &DateTime<Tz>) -> Self {
        Self(format!("{job}:after:{}", previous.timestamp()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SlotKey> for String {
    fn from(value: SlotKey) -> Self {
        value.0
    }
}

impl AsRef<str> for SlotKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
