use chrono::{DateTime, SecondsFormat, Utc};
use subtle::ConstantTimeEq;

/// RFC 3339 UTC with microseconds and a trailing `Z` — the wire form for
/// every timestamp this service emits.
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a wire timestamp back into `DateTime<Utc>`.
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Constant-time string equality, for comparing a user-typed pairing code
/// against the expected one without a timing side channel.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip_keeps_micros_and_z() {
        let now = Utc::now();
        let wire = rfc3339(now);
        assert!(wire.ends_with('Z'));
        let back = parse_rfc3339(&wire).unwrap();
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_rfc3339("not a timestamp").is_none());
        assert!(parse_rfc3339("").is_none());
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_str_eq("847293", "847293"));
        assert!(!constant_time_str_eq("847293", "847294"));
        assert!(!constant_time_str_eq("847293", "84729"));
    }
}
