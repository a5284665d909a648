//! Human readable durations.

use std::time::Duration;

/// Errors from [`parse_duration`].
#[derive(Debug, thiserror::Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration {input:?}: {source}")]
    Invalid {
        input: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Parses a duration such as `"5 seconds"`, `"100ms"` or `"1m 30s"`.
///
/// A bare integer is read as milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }

    if let Ok(millis) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }

    humantime::parse_duration(trimmed).map_err(|source| DurationError::Invalid {
        input: trimmed.to_owned(),
        source,
    })
}
