//! Server-time formatting for the IRCv3 `time` tag and playback prefixes.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};

/// Format the current time as an IRCv3 server-time string.
pub fn format_server_time() -> String {
    let now = Utc::now();
    format_timestamp(now.timestamp(), now.timestamp_subsec_micros())
}

/// Format a capture timestamp (seconds + microseconds) as an IRCv3
/// server-time string: ISO 8601 with milliseconds, UTC, `Z`-suffixed.
pub fn format_timestamp(secs: i64, micros: u32) -> String {
    match DateTime::<Utc>::from_timestamp(secs, micros.saturating_mul(1_000)) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => "1970-01-01T00:00:00.000Z".to_string(),
    }
}

/// Parse an IRCv3 server-time string back into (seconds, microseconds).
///
/// Returns `None` for anything that is not RFC 3339.
pub fn parse_server_time(ts: &str) -> Option<(i64, u32)> {
    let dt = DateTime::parse_from_rfc3339(ts).ok()?;
    Some((dt.timestamp(), dt.timestamp_subsec_micros()))
}

/// Human-readable timestamp prefix for clients without server-time:
/// `[HH:MM:SS]` in UTC.
pub fn human_timestamp(secs: i64) -> String {
    match DateTime::<Utc>::from_timestamp(secs, 0) {
        Some(dt) => format!("[{:02}:{:02}:{:02}]", dt.hour(), dt.minute(), dt.second()),
        None => "[00:00:00]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_timestamp_epoch() {
        assert_eq!(format_timestamp(0, 0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn format_timestamp_known_date() {
        // 2023-01-01 00:00:00 UTC = 1672531200
        assert_eq!(format_timestamp(1672531200, 0), "2023-01-01T00:00:00.000Z");
    }

    #[test]
    fn format_timestamp_millis_from_micros() {
        assert_eq!(
            format_timestamp(1672531200, 250_000),
            "2023-01-01T00:00:00.250Z"
        );
    }

    #[test]
    fn parse_server_time_valid() {
        let parsed = parse_server_time("2023-01-01T12:00:00.000Z").unwrap();
        assert_eq!(parsed, (1672574400, 0));
    }

    #[test]
    fn parse_server_time_invalid() {
        assert!(parse_server_time("not a timestamp").is_none());
        assert!(parse_server_time("").is_none());
    }

    #[test]
    fn roundtrip() {
        let formatted = format_timestamp(1672531200, 123_000);
        let (secs, micros) = parse_server_time(&formatted).unwrap();
        assert_eq!(secs, 1672531200);
        assert_eq!(micros, 123_000);
    }

    #[test]
    fn format_server_time_is_valid_rfc3339() {
        let ts = format_server_time();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn human_timestamp_format() {
        // 1672574400 = 2023-01-01 12:00:00 UTC
        assert_eq!(human_timestamp(1672574400), "[12:00:00]");
    }
}
