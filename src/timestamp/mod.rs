//! Time range parsing and validation for clip requests.

use serde::Serialize;

use crate::config::MAX_SEGMENT_SECONDS;

/// Why a requested range was rejected. The display strings are returned to API clients verbatim.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing fields")]
    MissingFields,

    #[error("invalid youtube url")]
    InvalidUrl,

    #[error("invalid timestamps")]
    InvalidRange,

    #[error("end must be after start")]
    OrderingError,

    #[error("segment too long (max {max}s)")]
    DurationExceeded { max: u64 },
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS` into seconds.
///
/// Dots are accepted as separators (`0.30` is thirty seconds). Components are read from the
/// right, each one worth 60 times the previous.
pub fn parse_timestamp(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace('.', ":");
    if cleaned.is_empty() {
        return None;
    }

    let mut seconds = 0.0;
    for (position, part) in cleaned.rsplit(':').enumerate() {
        let value: f64 = part.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        seconds += value * 60f64.powi(position as i32);
    }

    Some(seconds)
}

/// Check a parsed range against ordering and the maximum clip length.
pub fn validate_range(start: Option<f64>, end: Option<f64>) -> Result<(), ValidationError> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(ValidationError::InvalidRange);
    };

    if end <= start {
        return Err(ValidationError::OrderingError);
    }

    if end - start > MAX_SEGMENT_SECONDS as f64 {
        return Err(ValidationError::DurationExceeded {
            max: MAX_SEGMENT_SECONDS,
        });
    }

    Ok(())
}

/// A validated, immutable clip request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipRequest {
    pub source_url: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl ClipRequest {
    /// Build a request from raw timestamp strings, enforcing the range rules.
    pub fn parse(source_url: &str, start: &str, end: &str) -> Result<Self, ValidationError> {
        let start_seconds = parse_timestamp(start);
        let end_seconds = parse_timestamp(end);
        validate_range(start_seconds, end_seconds)?;

        Ok(Self {
            source_url: source_url.to_string(),
            // validate_range rejected the None cases above
            start_seconds: start_seconds.unwrap_or_default(),
            end_seconds: end_seconds.unwrap_or_default(),
        })
    }

    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}
