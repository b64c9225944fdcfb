use crate::config::types::TimestampConfig;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("invalid timestamp pattern: {0}")]
    BadPattern(#[from] regex::Error),

    #[error("timestamp pattern has no named group `ts`")]
    NoTsCapture,

    #[error("cannot read '{value}' as {format}: {reason}")]
    Unparseable {
        value: String,
        format: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    Iso8601,
    Epoch,
    EpochMs,
    Strftime(String),
}

impl TimestampFormat {
    pub fn from_name(name: &str) -> Self {
        match name {
            "iso8601" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other => TimestampFormat::Strftime(other.to_string()),
        }
    }

    fn name(&self) -> &str {
        match self {
            TimestampFormat::Iso8601 => "iso8601",
            TimestampFormat::Epoch => "epoch",
            TimestampFormat::EpochMs => "epoch_ms",
            TimestampFormat::Strftime(fmt) => fmt,
        }
    }

    pub fn parse(&self, value: &str) -> Result<DateTime<Utc>, TimestampError> {
        let fail = |reason: String| TimestampError::Unparseable {
            value: value.to_string(),
            format: self.name().to_string(),
            reason,
        };

        match self {
            TimestampFormat::Iso8601 => DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| fail(e.to_string())),
            TimestampFormat::Epoch | TimestampFormat::EpochMs => {
                let raw: i64 = value.parse().map_err(|e: std::num::ParseIntError| fail(e.to_string()))?;
                let millis = if *self == TimestampFormat::Epoch {
                    raw.checked_mul(1000)
                } else {
                    Some(raw)
                };
                millis
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .ok_or_else(|| fail("timestamp out of range".to_string()))
            }
            TimestampFormat::Strftime(fmt) => {
                if fmt.contains("%z") || fmt.contains("%Z") || fmt.contains("%:z") {
                    DateTime::parse_from_str(value, fmt)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| fail(e.to_string()))
                } else {
                    // No zone in the format: the value is taken as UTC
                    NaiveDateTime::parse_from_str(value, fmt)
                        .map(|ndt| Utc.from_utc_datetime(&ndt))
                        .map_err(|e| fail(e.to_string()))
                }
            }
        }
    }
}

/// Pulls an event time out of a raw log line.
#[derive(Debug)]
pub struct TimestampExtractor {
    pattern: Regex,
    format: TimestampFormat,
}

impl TimestampExtractor {
    /// `pattern` must contain a named capture group `ts`.
    pub fn new(pattern: &str, format: &str) -> Result<Self, TimestampError> {
        let pattern = Regex::new(pattern)?;
        if pattern.capture_names().all(|name| name != Some("ts")) {
            return Err(TimestampError::NoTsCapture);
        }

        Ok(Self {
            pattern,
            format: TimestampFormat::from_name(format),
        })
    }

    pub fn from_config(config: &TimestampConfig) -> Result<Self, TimestampError> {
        Self::new(&config.pattern, &config.format)
    }

    /// `Ok(None)` when the pattern does not match the line.
    pub fn extract(&self, line: &str) -> Result<Option<DateTime<Utc>>, TimestampError> {
        match self.pattern.captures(line).and_then(|caps| caps.name("ts")) {
            Some(ts) => self.format.parse(ts.as_str()).map(Some),
            None => Ok(None),
        }
    }

    /// Event time of `line`, or `fallback` when it has none or it cannot be parsed.
    pub fn extract_or(&self, line: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
        match self.extract(line) {
            Ok(Some(ts)) => ts,
            Ok(None) => fallback,
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable timestamp, using read time");
                fallback
            }
        }
    }
}
