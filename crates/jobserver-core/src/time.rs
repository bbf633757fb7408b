// ABOUTME: Timestamp normalization between native, integer, float and string inputs and stored microseconds.
// ABOUTME: Also provides the monotonic clock that stamps job and server updates.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::EntryError;

/// Convert a timestamp to the stored encoding: microseconds since the Unix epoch.
pub fn to_micros(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

/// Rebuild a timestamp from its stored microsecond encoding.
pub fn from_micros(micros: i64) -> Result<DateTime<Utc>, EntryError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| EntryError::InvalidTimestamp(micros.to_string()))
}

/// Truncate a timestamp to the precision the store keeps.
pub fn truncate(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// Current time at stored precision.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Any of the accepted spellings of a timestamp.
///
/// Integers are microseconds since the epoch, floats are seconds. A string is
/// parsed as an integer first (microseconds), then as a float (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampInput {
    Native(DateTime<Utc>),
    Micros(i64),
    Seconds(f64),
    Text(String),
}

impl TimestampInput {
    /// Normalize to a native timestamp at microsecond precision.
    pub fn normalize(&self) -> Result<DateTime<Utc>, EntryError> {
        match self {
            TimestampInput::Native(at) => Ok(truncate(*at)),
            TimestampInput::Micros(micros) => from_micros(*micros),
            TimestampInput::Seconds(secs) => seconds_to_timestamp(*secs),
            TimestampInput::Text(text) => {
                let trimmed = text.trim();
                if let Ok(micros) = trimmed.parse::<i64>() {
                    return from_micros(micros);
                }
                match trimmed.parse::<f64>() {
                    Ok(secs) => seconds_to_timestamp(secs),
                    Err(_) => Err(EntryError::InvalidTimestamp(text.clone())),
                }
            }
        }
    }
}

impl From<DateTime<Utc>> for TimestampInput {
    fn from(at: DateTime<Utc>) -> Self {
        TimestampInput::Native(at)
    }
}

impl From<i64> for TimestampInput {
    fn from(micros: i64) -> Self {
        TimestampInput::Micros(micros)
    }
}

impl From<f64> for TimestampInput {
    fn from(secs: f64) -> Self {
        TimestampInput::Seconds(secs)
    }
}

impl From<&str> for TimestampInput {
    fn from(text: &str) -> Self {
        TimestampInput::Text(text.to_string())
    }
}

fn seconds_to_timestamp(secs: f64) -> Result<DateTime<Utc>, EntryError> {
    if !secs.is_finite() {
        return Err(EntryError::InvalidTimestamp(secs.to_string()));
    }
    let micros = (secs * 1_000_000.0).round();
    if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
        return Err(EntryError::InvalidTimestamp(secs.to_string()));
    }
    from_micros(micros as i64)
}

/// Hands out strictly increasing timestamps at microsecond precision.
///
/// Update tables key rows on their timestamp, so two updates stamped in the
/// same microsecond would collide. The clock never returns the same value twice
/// and never goes backwards, even if the wall clock does.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return DateTime::<Utc>::from_timestamp_micros(next).unwrap_or_else(now);
                }
                Err(actual) => last = actual,
            }
        }
    }
}
