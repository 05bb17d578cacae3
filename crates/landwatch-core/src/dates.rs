use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a valid ISO date")]
pub struct DateError(pub String);

pub fn today(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

pub fn is_current_date(date: NaiveDate, now: DateTime<Utc>) -> bool {
    date == today(now)
}

/// Parses `YYYY-MM-DD` or a full RFC 3339 timestamp, keeping the UTC calendar date.
pub fn parse_analysis_date(raw: &str) -> Result<NaiveDate, DateError> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|stamp| stamp.with_timezone(&Utc).date_naive())
        .map_err(|_| DateError(trimmed.to_owned()))
}

/// Absent or blank input resolves to today's UTC date.
pub fn resolve_analysis_date(
    raw: Option<&str>,
    now: DateTime<Utc>,
) -> Result<NaiveDate, DateError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => parse_analysis_date(value),
        None => Ok(today(now)),
    }
}
