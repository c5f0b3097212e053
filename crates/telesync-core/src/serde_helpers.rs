//! Serde adapters for wire formats produced by heterogeneous backends.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Parse a timestamp from RFC 3339, a naive ISO-8601 string (assumed UTC),
/// or a number of epoch seconds.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Convert fractional epoch seconds to a UTC timestamp.
pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}

/// `#[serde(with = "flexible_timestamp")]` for `DateTime<Utc>` fields.
pub mod flexible_timestamp {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Text(String),
        Seconds(f64),
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Text(text) => parse_timestamp(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {text:?}"))),
            RawTimestamp::Seconds(secs) => from_epoch_seconds(secs)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid epoch seconds: {secs}"))),
        }
    }
}

/// Same as [`flexible_timestamp`] for `Option<DateTime<Utc>>`.
pub mod flexible_timestamp_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "flexible_timestamp")] DateTime<Utc>);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(dt)| dt))
    }
}
