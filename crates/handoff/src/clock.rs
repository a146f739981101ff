use chrono::{DateTime, Datelike, Duration, SecondsFormat, Utc};

/// Latest instant a stamp can hold and still sort correctly.
const MAX_YEAR: i32 = 9999;

/// Fixed-width RFC 3339 (`2026-01-02T03:04:05.678Z`) so stored timestamps sort
/// lexicographically in SQL the same way they sort chronologically.
pub fn stamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_stamp() -> String {
    stamp(Utc::now())
}

pub fn parse(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn minutes(m: i64) -> Option<Duration> {
    Duration::try_minutes(m)
}

pub fn hours(h: i64) -> Option<Duration> {
    Duration::try_hours(h)
}

/// `base + window`, or None when the result would not fit in a stamp.
/// Callers treat None as "no deadline".
pub fn after(base: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    base.checked_add_signed(window)
        .filter(|dt| dt.year() <= MAX_YEAR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn stamps_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + Duration::milliseconds(7);
        let c = a + Duration::hours(30);
        let mut v = vec![stamp(c), stamp(a), stamp(b)];
        v.sort();
        assert_eq!(v, vec![stamp(a), stamp(b), stamp(c)]);
        assert_eq!(stamp(a), "2026-01-02T03:04:05.000Z");
    }

    #[test]
    fn parse_round_trips() {
        let a = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        assert_eq!(parse(&stamp(a)), Some(a));
        assert_eq!(parse("not a time"), None);
    }

    #[test]
    fn oversized_windows_yield_no_deadline() {
        let a = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        assert_eq!(after(a, Duration::hours(1)), Some(a + Duration::hours(1)));
        assert_eq!(minutes(i64::MAX / 2), None);
        assert_eq!(hours(i64::MAX / 4), None);
        // Representable, but past what a four-digit year stamp can order.
        assert_eq!(minutes(i64::MAX / 60_000).and_then(|w| after(a, w)), None);
        assert_eq!(minutes(60 * 24 * 365 * 10_000).and_then(|w| after(a, w)), None);
    }
}
