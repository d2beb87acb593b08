//! Common types used across the SIRI-VM workspace

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of one object in the source bucket (its key).
///
/// Every item derived from an object carries the key it came from, so it is
/// cloned once per record. Backed by `Arc<str>` to keep that cheap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(Arc<str>);

impl SourceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for SourceKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Stable identity of one logical vehicle observation.
///
/// Derived from domain fields, never from the object key: the same observation
/// appearing in two snapshots yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Placeholder used when a record carries no operator reference
    pub const NO_OPERATOR: &'static str = "-";

    /// Build the key `{operator}:{vehicle}@{recorded_at}`
    ///
    /// The timestamp is rendered in UTC at second precision so that equivalent
    /// offsets (`+01:00` vs `Z`) collapse onto the same key. `%`, `:` and `@`
    /// inside the references are percent-encoded, as is an operator spelled
    /// exactly like [`DedupKey::NO_OPERATOR`], so distinct field values never
    /// render to the same key.
    pub fn new(operator_ref: Option<&str>, vehicle_ref: &str, recorded_at: DateTime<Utc>) -> Self {
        let operator = match operator_ref {
            None => Self::NO_OPERATOR.to_string(),
            Some(op) if op == Self::NO_OPERATOR => "%2D".to_string(),
            Some(op) => escape_component(op),
        };

        Self(format!(
            "{}:{}@{}",
            operator,
            escape_component(vehicle_ref),
            recorded_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ))
    }

    /// Wrap a key previously rendered by [`DedupKey::new`] (e.g. read back from storage)
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '@' => out.push_str("%40"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated, normalized vehicle position ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleLocation {
    /// Object the record was extracted from
    pub source: SourceKey,

    /// Identity used for at-most-once insertion
    pub dedup_key: DedupKey,

    /// Vehicle identifier as published by the operator
    pub vehicle_ref: String,

    /// Observation time (UTC)
    pub recorded_at: DateTime<Utc>,

    /// End of the validity period of the observation, if published
    pub valid_until: Option<DateTime<Utc>>,

    pub latitude: f64,
    pub longitude: f64,

    /// Heading in degrees, `[0, 360)`
    pub bearing: Option<f64>,

    pub item_identifier: Option<String>,
    pub line_ref: Option<String>,
    pub published_line_name: Option<String>,
    pub direction_ref: Option<String>,
    pub operator_ref: Option<String>,
    pub origin_ref: Option<String>,
    pub origin_name: Option<String>,
    pub destination_ref: Option<String>,
    pub destination_name: Option<String>,
    pub origin_aimed_departure: Option<DateTime<Utc>>,
    pub block_ref: Option<String>,
    pub journey_ref: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    #[test]
    fn test_dedup_key_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 5).unwrap();
        let key = DedupKey::new(Some("FBRI"), "36921", at);
        assert_eq!(key.as_str(), "FBRI:36921@2024-01-15T12:00:05Z");
    }

    #[test]
    fn test_dedup_key_without_operator() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 5).unwrap();
        let key = DedupKey::new(None, "36921", at);
        assert_eq!(key.as_str(), "-:36921@2024-01-15T12:00:05Z");
    }

    #[test]
    fn test_dedup_key_separators_do_not_collide() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 5).unwrap();

        let left = DedupKey::new(Some("A:B"), "C", at);
        let right = DedupKey::new(Some("A"), "B:C", at);
        assert_ne!(left, right);
        assert_eq!(left.as_str(), "A%3AB:C@2024-01-15T12:00:05Z");
        assert_eq!(right.as_str(), "A:B%3AC@2024-01-15T12:00:05Z");

        assert_ne!(
            DedupKey::new(Some("A"), "B@2024-01-15T12:00:05Z", at),
            DedupKey::new(Some("A"), "B", at)
        );
        assert_ne!(DedupKey::new(Some("%3A"), "C", at), DedupKey::new(Some(":"), "C", at));
        assert_ne!(DedupKey::new(Some("-"), "C", at), DedupKey::new(None, "C", at));
    }

    #[test]
    fn test_dedup_key_ignores_offset_notation() {
        let zulu = DateTime::parse_from_rfc3339("2024-01-15T12:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let offset = DateTime::parse_from_rfc3339("2024-01-15T13:00:05+01:00")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(
            DedupKey::new(Some("FBRI"), "36921", zulu),
            DedupKey::new(Some("FBRI"), "36921", offset)
        );
    }

    #[test]
    fn test_source_key_serializes_as_string() {
        let key = SourceKey::new("sirivm/a.zip");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"sirivm/a.zip\"");
        assert_eq!(key.to_string(), "sirivm/a.zip");
    }
}
