//! Timestamp utilities
//!
//! The whole suite operates in a single fixed local offset (JST, UTC+9).
//! Timestamps are truncated to second precision before they are stored or
//! compared, matching the precision of the event log encoding.

use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Timelike, Utc};

const UTC_OFFSET_SECS: i32 = 9 * 3600;

/// The fixed local offset (JST)
pub fn local_offset() -> FixedOffset {
    FixedOffset::east_opt(UTC_OFFSET_SECS).expect("valid UTC offset")
}

/// Current local timestamp, truncated to whole seconds
pub fn now() -> DateTime<FixedOffset> {
    truncate_to_second(Utc::now().with_timezone(&local_offset()))
}

/// Drop subsecond precision
pub fn truncate_to_second(dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    dt.with_nanosecond(0).unwrap_or(dt)
}

/// Calendar date of a timestamp in the local offset
pub fn local_date(dt: &DateTime<FixedOffset>) -> NaiveDate {
    dt.with_timezone(&local_offset()).date_naive()
}

/// RFC 3339 rendering at second precision, e.g. `2025-04-01T09:00:00+09:00`
pub fn to_iso(dt: &DateTime<FixedOffset>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parse an RFC 3339 timestamp as stored in the event log
pub fn parse_iso(s: &str) -> chrono::ParseResult<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_second_precision() {
        let ts = now();
        assert_eq!(ts.timestamp_subsec_nanos(), 0);
    }

    #[tokio::test]
    async fn test_now_successive_calls_advance() {
        let first = now();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = now();
        assert!(second > first);
    }

    #[test]
    fn test_iso_round_trip() {
        let ts = parse_iso("2025-04-01T09:30:00+09:00").unwrap();
        assert_eq!(to_iso(&ts), "2025-04-01T09:30:00+09:00");
        assert_eq!(parse_iso(&to_iso(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_local_date_uses_offset() {
        // 23:30 UTC on the 1st is already the 2nd in JST
        let ts = parse_iso("2025-04-01T23:30:00+00:00").unwrap();
        assert_eq!(local_date(&ts).to_string(), "2025-04-02");
    }

    #[test]
    fn test_truncate_to_second() {
        let ts = parse_iso("2025-04-01T09:30:00.750+09:00").unwrap();
        let truncated = truncate_to_second(ts);
        assert_eq!(truncated.timestamp_subsec_nanos(), 0);
        assert_eq!(to_iso(&truncated), "2025-04-01T09:30:00+09:00");
    }
}
