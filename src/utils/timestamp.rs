//! UTC timestamp formats shared by artifacts, backups and records.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Compact second-resolution stamp used in artifact names.
pub const ARTIFACT_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Microsecond stamp used for backup directory names.
pub const BACKUP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn artifact_stamp(at: DateTime<Utc>) -> String {
    at.format(ARTIFACT_FORMAT).to_string()
}

pub fn backup_stamp(at: DateTime<Utc>) -> String {
    at.format(BACKUP_FORMAT).to_string()
}

pub fn parse_backup_stamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.strip_suffix('Z')?;
    NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Current time, nudged forward so it is strictly later than `after`.
pub fn strictly_after(after: DateTime<Utc>) -> DateTime<Utc> {
    let current = Utc::now();
    if current > after {
        current
    } else {
        after + Duration::microseconds(1)
    }
}
