use chrono::{DateTime, Duration, Utc};

/// Resolve the effective event time.
///
/// Precedence:
/// 1. `timestamp` and `sent_at` both present: `now + (timestamp - sent_at)`,
///    which cancels client clock skew while preserving ordering in the
///    client's frame.
/// 2. `timestamp` alone: taken verbatim.
/// 3. `offset` (milliseconds): `now - offset`.
/// 4. `now`.
///
/// An unparseable `timestamp` falls through to the next rule.
pub fn parse_event_timestamp(
    timestamp: Option<&str>,
    offset: Option<i64>,
    sent_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if let Some(parsed) = timestamp.and_then(parse_date) {
        return match sent_at {
            Some(sent_at) => now + parsed.signed_duration_since(sent_at),
            None => parsed,
        };
    }

    if let Some(offset_ms) = offset {
        return now - Duration::milliseconds(offset_ms);
    }

    now
}

/// Parse a client-supplied date string: RFC 3339 first, then epoch
/// milliseconds or seconds for the numeric senders.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    let numeric: i64 = input.parse().ok()?;
    // Millisecond timestamps of plausible events are 13 digits; anything
    // shorter is seconds.
    if numeric.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(numeric)
    } else {
        DateTime::from_timestamp(numeric, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn skew_correction_when_both_present() {
        let now = utc("2024-01-01T10:00:00Z");
        // Client clock is an hour ahead; the event is 10s older than sent_at.
        let resolved = parse_event_timestamp(
            Some("2024-01-01T10:59:50Z"),
            None,
            Some(utc("2024-01-01T11:00:00Z")),
            now,
        );
        assert_eq!(resolved, utc("2024-01-01T09:59:50Z"));
    }

    #[test]
    fn timestamp_verbatim_without_sent_at() {
        let now = utc("2024-01-01T10:00:00Z");
        let resolved = parse_event_timestamp(Some("2023-06-15T08:30:00Z"), None, None, now);
        assert_eq!(resolved, utc("2023-06-15T08:30:00Z"));
    }

    #[test]
    fn offset_subtracts_from_now() {
        let now = utc("2024-01-01T10:00:00Z");
        let resolved = parse_event_timestamp(None, Some(60_000), None, now);
        assert_eq!(resolved, utc("2024-01-01T09:59:00Z"));
    }

    #[test]
    fn unparseable_timestamp_falls_through_to_offset() {
        let now = utc("2024-01-01T10:00:00Z");
        let resolved = parse_event_timestamp(Some("not a date"), Some(1_000), None, now);
        assert_eq!(resolved, utc("2024-01-01T09:59:59Z"));
    }

    #[test]
    fn defaults_to_now() {
        let now = utc("2024-01-01T10:00:00Z");
        assert_eq!(parse_event_timestamp(None, None, None, now), now);
        assert_eq!(
            parse_event_timestamp(Some("garbage"), None, None, now),
            now
        );
    }

    #[test]
    fn parses_epoch_millis_and_seconds() {
        assert_eq!(
            parse_date("1672574400000"),
            Some(utc("2023-01-01T12:00:00Z"))
        );
        assert_eq!(parse_date("1672574400"), Some(utc("2023-01-01T12:00:00Z")));
    }
}
