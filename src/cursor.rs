//! Snowflake-style cursors.
//!
//! Platform message ids encode milliseconds since a fixed epoch in their high
//! bits. The low 22 bits carry worker/sequence data and are always zero for a
//! cursor synthesized from a wall-clock time, so a real id can be marginally
//! larger than the synthesized cursor for the same millisecond. Treat
//! time-derived cursors as inclusive lower bounds, never as exact matches.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 2015-01-01T00:00:00Z in unix milliseconds.
pub const PLATFORM_EPOCH_MS: i64 = 1_420_070_400_000;

/// Bits reserved below the timestamp for worker/process/sequence numbers.
pub const SEQUENCE_BITS: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor(u64);

#[derive(Debug, thiserror::Error)]
#[error("invalid cursor '{0}'")]
pub struct CursorParseError(String);

impl Cursor {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Encodes `t` truncated to the millisecond. Times before the platform
    /// epoch clamp to zero.
    pub fn from_time(t: DateTime<Utc>) -> Self {
        let elapsed = t.timestamp_millis().saturating_sub(PLATFORM_EPOCH_MS).max(0) as u64;
        Self(elapsed << SEQUENCE_BITS)
    }

    pub fn to_time(self) -> DateTime<Utc> {
        let ms = (self.0 >> SEQUENCE_BITS) as i64 + PLATFORM_EPOCH_MS;
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    /// First cursor of the following millisecond.
    pub fn next_millisecond(self) -> Self {
        Self(((self.0 >> SEQUENCE_BITS) + 1) << SEQUENCE_BITS)
    }
}

pub fn time_to_cursor(t: DateTime<Utc>) -> Cursor {
    Cursor::from_time(t)
}

pub fn cursor_to_time(c: Cursor) -> DateTime<Utc> {
    c.to_time()
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Cursor)
            .map_err(|_| CursorParseError(s.to_string()))
    }
}

// Ids travel as decimal strings; 64-bit integers do not survive JSON consumers.
impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
