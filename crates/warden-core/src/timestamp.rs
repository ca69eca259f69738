//! UTC timestamp with a stable wire form.
//!
//! Serialized as RFC 3339 with microsecond precision and a `Z`
//! suffix. The ledger canonicalizer hashes these strings, so the
//! format must never drift between writers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// The current time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing `DateTime`.
    #[must_use]
    pub const fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// The canonical string form: RFC 3339, microseconds, `Z` offset.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Parse from an RFC 3339 string (accepts `Z` or numeric offsets).
    ///
    /// # Errors
    ///
    /// Returns a parse error for anything that is not RFC 3339.
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)?;
        Ok(Self(dt.with_timezone(&Utc)))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_roundtrip() {
        let ts = Timestamp::now();
        let parsed = Timestamp::parse(&ts.to_rfc3339()).unwrap();
        // Micros precision survives the round trip.
        assert_eq!(ts.to_rfc3339(), parsed.to_rfc3339());
    }

    #[test]
    fn test_serde_uses_canonical_form() {
        let ts = Timestamp::now();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, format!("\"{}\"", ts.to_rfc3339()));
        assert!(json.ends_with("Z\""));
    }

    #[test]
    fn test_parse_accepts_offset() {
        let ts = Timestamp::parse("2024-01-01T12:00:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T10:00:00.000000Z");
    }
}
