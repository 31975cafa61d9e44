use chrono::{DateTime, SecondsFormat, Utc};

/// Single clock helper — every writer in the process goes through this
/// so `entry_updated_at` comparisons stay consistent.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Canonical storage format: RFC 3339 UTC with microsecond precision.
/// Lexicographic ordering of stored strings matches chronological order.
pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into a `DateTime<Utc>`.
pub fn from_db(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn round_trips_through_storage_format() {
        let now = utc_now();
        let parsed = from_db(&to_db(now)).unwrap();
        assert_eq!(to_db(now), to_db(parsed));
    }

    #[test]
    fn storage_format_orders_lexicographically() {
        let a = utc_now();
        let b = a + Duration::milliseconds(5);
        assert!(to_db(a) < to_db(b));
    }
}
