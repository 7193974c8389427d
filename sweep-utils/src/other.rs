//! Module containing some utility functions that didn't fit anywhere else.

use time::{format_description, OffsetDateTime};

/// Format used for human-readable timestamps, e.g. in file names of sweep-wide outputs.
const TIMESTAMP_FORMAT: &str = "[year]-[month]-[day]_[hour]-[minute]-[second]";

/// Format used for measurement artifacts, e.g. `iperf3_20240131-142501.jsonl`.
const ARTIFACT_TIMESTAMP_FORMAT: &str = "[year][month][day]-[hour][minute][second]";

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn format_now(format: &str) -> String {
    // constant format descriptions, neither parsing nor formatting can fail
    let description = format_description::parse(format).unwrap_or_default();
    now().format(&description).unwrap_or_default()
}

/// Produces a timestamp `String` of the current time in YYYY-MM-DD_HH-mm-SS format.
pub fn get_timestamp() -> String {
    format_now(TIMESTAMP_FORMAT)
}

/// Produces a timestamp `String` of the current time in YYYYMMDD-HHmmSS format.
pub fn get_artifact_timestamp() -> String {
    format_now(ARTIFACT_TIMESTAMP_FORMAT)
}
