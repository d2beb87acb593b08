//! Validation and normalization of parsed records

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use sirivm_common::{DedupKey, VehicleLocation};
use thiserror::Error;

use super::parser::ParsedRecord;

/// Default tolerance for observation times ahead of the local clock.
pub const DEFAULT_MAX_FUTURE_SKEW_MINUTES: i64 = 5;

/// Why a record was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("{field} is not a valid timestamp: '{value}'")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("{field} is not a number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("position is the (0, 0) placeholder")]
    NullIsland,

    #[error("RecordedAtTime {recorded_at} is in the future")]
    FutureObservation { recorded_at: DateTime<Utc> },

    #[error("ValidUntilTime {valid_until} precedes RecordedAtTime {recorded_at}")]
    ExpiredBeforeRecorded {
        recorded_at: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    },
}

/// Accepts or rejects one parsed record
///
/// Called from the blocking pool; implementations must not touch shared mutable state.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, record: ParsedRecord) -> Result<VehicleLocation, ValidationError>;
}

/// Rule set for SIRI-VM vehicle positions
#[derive(Debug, Clone)]
pub struct SiriVmValidator {
    max_future_skew: Duration,
}

impl Default for SiriVmValidator {
    fn default() -> Self {
        Self {
            max_future_skew: Duration::minutes(DEFAULT_MAX_FUTURE_SKEW_MINUTES),
        }
    }
}

impl SiriVmValidator {
    pub fn with_max_future_skew(max_future_skew: Duration) -> Self {
        Self { max_future_skew }
    }

    /// Validate against an explicit clock reading
    pub fn validate_at(
        &self,
        record: ParsedRecord,
        now: DateTime<Utc>,
    ) -> Result<VehicleLocation, ValidationError> {
        let vehicle_ref =
            clean(record.vehicle_ref).ok_or(ValidationError::MissingField("VehicleRef"))?;

        let recorded_at = required_timestamp("RecordedAtTime", record.recorded_at_time)?;
        if recorded_at > now + self.max_future_skew {
            return Err(ValidationError::FutureObservation { recorded_at });
        }

        let valid_until = optional_timestamp("ValidUntilTime", record.valid_until_time)?;
        if let Some(valid_until) = valid_until {
            if valid_until < recorded_at {
                return Err(ValidationError::ExpiredBeforeRecorded {
                    recorded_at,
                    valid_until,
                });
            }
        }

        let latitude = required_number("Latitude", record.latitude)?;
        let longitude = required_number("Longitude", record.longitude)?;
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(ValidationError::OutOfRange {
                field: "Latitude",
                value: latitude,
            });
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(ValidationError::OutOfRange {
                field: "Longitude",
                value: longitude,
            });
        }
        if latitude == 0.0 && longitude == 0.0 {
            return Err(ValidationError::NullIsland);
        }

        let bearing = match optional_number("Bearing", record.bearing)? {
            Some(b) if !(0.0..=360.0).contains(&b) => {
                return Err(ValidationError::OutOfRange {
                    field: "Bearing",
                    value: b,
                })
            },
            Some(b) if b == 360.0 => Some(0.0),
            other => other,
        };

        let origin_aimed_departure =
            optional_timestamp("OriginAimedDepartureTime", record.origin_aimed_departure_time)?;

        let operator_ref = clean(record.operator_ref);
        let dedup_key = DedupKey::new(operator_ref.as_deref(), &vehicle_ref, recorded_at);

        Ok(VehicleLocation {
            source: record.source,
            dedup_key,
            vehicle_ref,
            recorded_at,
            valid_until,
            latitude,
            longitude,
            bearing,
            item_identifier: clean(record.item_identifier),
            line_ref: clean(record.line_ref),
            published_line_name: clean(record.published_line_name),
            direction_ref: clean(record.direction_ref),
            operator_ref,
            origin_ref: clean(record.origin_ref),
            origin_name: clean(record.origin_name),
            destination_ref: clean(record.destination_ref),
            destination_name: clean(record.destination_name),
            origin_aimed_departure,
            block_ref: clean(record.block_ref),
            journey_ref: clean(record.journey_ref),
        })
    }
}

impl RecordValidator for SiriVmValidator {
    fn validate(&self, record: ParsedRecord) -> Result<VehicleLocation, ValidationError> {
        self.validate_at(record, Utc::now())
    }
}

/// Trim; empty strings become `None`
fn clean(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == v.len() {
            Some(v)
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// RFC 3339, or an offset-less ISO 8601 timestamp read as UTC
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn optional_timestamp(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match clean(value) {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or(ValidationError::InvalidTimestamp { field, value: raw }),
    }
}

fn required_timestamp(
    field: &'static str,
    value: Option<String>,
) -> Result<DateTime<Utc>, ValidationError> {
    optional_timestamp(field, value)?.ok_or(ValidationError::MissingField(field))
}

fn optional_number(field: &'static str, value: Option<String>) -> Result<Option<f64>, ValidationError> {
    match clean(value) {
        None => Ok(None),
        Some(raw) => match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Some(n)),
            _ => Err(ValidationError::InvalidNumber { field, value: raw }),
        },
    }
}

fn required_number(field: &'static str, value: Option<String>) -> Result<f64, ValidationError> {
    optional_number(field, value)?.ok_or(ValidationError::MissingField(field))
}
