//! Shared helpers: truncation and report timestamp formatting

use chrono::{DateTime, FixedOffset, Utc};

/// Reports and outcome timestamps are rendered in UTC-3
const REPORT_OFFSET_HOURS: i32 = 3;

/// Truncate a string on a char boundary, appending a marker when cut
#[must_use]
pub fn truncate_safe(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &text[..end])
}

/// The fixed offset used for all human-facing timestamps
#[must_use]
pub fn report_offset() -> FixedOffset {
    FixedOffset::west_opt(REPORT_OFFSET_HOURS * 3600).expect("UTC-3 is a valid offset")
}

/// Format a timestamp for summary reports: `YYYY-MM-DD HH:MM:SS` in UTC-3
#[must_use]
pub fn format_report_timestamp(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&report_offset())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// ISO-8601 timestamp in UTC-3, used for outcome records
#[must_use]
pub fn iso_timestamp(instant: DateTime<Utc>) -> String {
    instant.with_timezone(&report_offset()).to_rfc3339()
}
