use std::fmt;

use chrono::Local;
use thiserror::Error;

/// Exact byte width of a formatted timestamp, `[YYYY-MM-DD HH:MM:SS.mmm]`.
///
/// The wire protocol carries timestamps as a fixed-width ASCII field, so the
/// format must always render to this length.
pub const TIMESTAMP_LEN: usize = 25;

const TIMESTAMP_FORMAT: &str = "[%Y-%m-%d %H:%M:%S%.3f]";
const FIELD_SEPARATOR: &str = "::";

/// One timestamped sample, the unit persisted to the log and broadcast to
/// clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub timestamp: String,
    pub value: i32,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record line is missing the '::' separator: {0:?}")]
    MissingSeparator(String),
    #[error("timestamp must be {TIMESTAMP_LEN} bytes, got {0}")]
    BadTimestampLength(usize),
    #[error("value field is not an integer: {0:?}")]
    BadValue(String),
}

impl SampleRecord {
    /// Builds a record from an already-formatted timestamp.
    pub fn new(timestamp: impl Into<String>, value: i32) -> Result<Self, RecordError> {
        let timestamp = timestamp.into();
        if timestamp.len() != TIMESTAMP_LEN {
            return Err(RecordError::BadTimestampLength(timestamp.len()));
        }
        Ok(Self { timestamp, value })
    }

    /// Stamps a value with the current wall-clock time at millisecond
    /// precision.
    pub fn now(value: i32) -> Self {
        Self {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            value,
        }
    }

    /// Parses one log line of the form `<timestamp>::<value>`.
    pub fn parse_line(line: &str) -> Result<Self, RecordError> {
        let (timestamp, value) = line
            .split_once(FIELD_SEPARATOR)
            .ok_or_else(|| RecordError::MissingSeparator(line.to_string()))?;
        let value = value
            .trim()
            .parse::<i32>()
            .map_err(|_| RecordError::BadValue(value.to_string()))?;
        Self::new(timestamp, value)
    }
}

impl fmt::Display for SampleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.timestamp, FIELD_SEPARATOR, self.value)
    }
}
