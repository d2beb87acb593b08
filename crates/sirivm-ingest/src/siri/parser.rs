//! SIRI-VM XML parsing
//!
//! Deserializes the `Siri/ServiceDelivery/VehicleMonitoringDelivery/VehicleActivity`
//! tree with quick-xml's serde support. Values are kept as the raw published
//! strings; interpretation (timestamps, coordinates) belongs to the validator.

use serde::Deserialize;
use sirivm_common::SourceKey;
use thiserror::Error;

/// Parse failures for a whole payload
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("malformed SIRI-VM document: {0}")]
    Xml(#[from] quick_xml::DeError),
}

/// One `VehicleActivity` as published, tagged with the object it came from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRecord {
    pub source: SourceKey,
    /// Position of the activity within its document
    pub index: usize,

    pub recorded_at_time: Option<String>,
    pub item_identifier: Option<String>,
    pub valid_until_time: Option<String>,
    pub line_ref: Option<String>,
    pub published_line_name: Option<String>,
    pub direction_ref: Option<String>,
    pub operator_ref: Option<String>,
    pub origin_ref: Option<String>,
    pub origin_name: Option<String>,
    pub destination_ref: Option<String>,
    pub destination_name: Option<String>,
    pub origin_aimed_departure_time: Option<String>,
    pub longitude: Option<String>,
    pub latitude: Option<String>,
    pub bearing: Option<String>,
    pub block_ref: Option<String>,
    pub journey_ref: Option<String>,
    pub vehicle_ref: Option<String>,
}

/// Turns a decompressed payload into records
///
/// Called from the blocking pool; implementations must not do I/O.
pub trait RecordParser: Send + Sync {
    fn parse(&self, source: &SourceKey, data: &[u8]) -> Result<Vec<ParsedRecord>, ParseError>;
}

/// Parser for SIRI 2.0 Vehicle Monitoring documents
#[derive(Debug, Clone, Copy, Default)]
pub struct SiriVmParser;

impl RecordParser for SiriVmParser {
    fn parse(&self, source: &SourceKey, data: &[u8]) -> Result<Vec<ParsedRecord>, ParseError> {
        let text = std::str::from_utf8(data)?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let document: Siri = quick_xml::de::from_str(text)?;

        let records = document
            .service_delivery
            .vehicle_monitoring_delivery
            .into_iter()
            .flat_map(|delivery| delivery.vehicle_activity)
            .enumerate()
            .map(|(index, activity)| activity.into_record(source.clone(), index))
            .collect();

        Ok(records)
    }
}

// ============================================================================
// Document model
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Siri {
    service_delivery: ServiceDelivery,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceDelivery {
    #[serde(default)]
    vehicle_monitoring_delivery: Vec<VehicleMonitoringDelivery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VehicleMonitoringDelivery {
    #[serde(default)]
    vehicle_activity: Vec<VehicleActivity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VehicleActivity {
    #[serde(default)]
    recorded_at_time: Option<String>,
    #[serde(default)]
    item_identifier: Option<String>,
    #[serde(default)]
    valid_until_time: Option<String>,
    #[serde(default)]
    monitored_vehicle_journey: Option<MonitoredVehicleJourney>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MonitoredVehicleJourney {
    #[serde(default)]
    line_ref: Option<String>,
    #[serde(default)]
    direction_ref: Option<String>,
    #[serde(default)]
    framed_vehicle_journey_ref: Option<FramedVehicleJourneyRef>,
    #[serde(default)]
    vehicle_journey_ref: Option<String>,
    #[serde(default)]
    published_line_name: Option<String>,
    #[serde(default)]
    operator_ref: Option<String>,
    #[serde(default)]
    origin_ref: Option<String>,
    #[serde(default)]
    origin_name: Option<String>,
    #[serde(default)]
    destination_ref: Option<String>,
    #[serde(default)]
    destination_name: Option<String>,
    #[serde(default)]
    origin_aimed_departure_time: Option<String>,
    #[serde(default)]
    vehicle_location: Option<Location>,
    #[serde(default)]
    bearing: Option<String>,
    #[serde(default)]
    block_ref: Option<String>,
    #[serde(default)]
    vehicle_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FramedVehicleJourneyRef {
    #[serde(default)]
    dated_vehicle_journey_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Location {
    #[serde(default)]
    longitude: Option<String>,
    #[serde(default)]
    latitude: Option<String>,
}

impl VehicleActivity {
    fn into_record(self, source: SourceKey, index: usize) -> ParsedRecord {
        let journey = self.monitored_vehicle_journey.unwrap_or_default();
        let (longitude, latitude) = journey
            .vehicle_location
            .map(|loc| (loc.longitude, loc.latitude))
            .unwrap_or((None, None));
        let journey_ref = journey
            .framed_vehicle_journey_ref
            .and_then(|framed| framed.dated_vehicle_journey_ref)
            .or(journey.vehicle_journey_ref);

        ParsedRecord {
            source,
            index,
            recorded_at_time: self.recorded_at_time,
            item_identifier: self.item_identifier,
            valid_until_time: self.valid_until_time,
            line_ref: journey.line_ref,
            published_line_name: journey.published_line_name,
            direction_ref: journey.direction_ref,
            operator_ref: journey.operator_ref,
            origin_ref: journey.origin_ref,
            origin_name: journey.origin_name,
            destination_ref: journey.destination_ref,
            destination_name: journey.destination_name,
            origin_aimed_departure_time: journey.origin_aimed_departure_time,
            longitude,
            latitude,
            bearing: journey.bearing,
            block_ref: journey.block_ref,
            journey_ref,
            vehicle_ref: journey.vehicle_ref,
        }
    }
}
