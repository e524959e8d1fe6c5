use chrono::{DateTime, TimeZone, Utc};

/// Parses an RFC3339 timestamp, panicking on malformed input.
///
/// Only use where the input is already known to be well-formed (config
/// defaults, values the process itself produced); reject/propagate
/// malformed timestamps coming from a peer or a user instead.
pub fn parse_utc_from_rfc3339(input: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(input)
        .unwrap()
        .with_timezone(&Utc)
}

pub fn to_rfc3339<T>(input: &DateTime<T>) -> String
where
    T: TimeZone,
    <T as TimeZone>::Offset: std::fmt::Display,
{
    input.to_rfc3339_opts(chrono::SecondsFormat::Secs, /* use_z */ true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_rfc3339() {
        let now = Utc::now();
        let formatted = to_rfc3339(&now);
        let parsed = parse_utc_from_rfc3339(&formatted);
        assert_eq!(now.timestamp(), parsed.timestamp());
    }
}
