//! Shared fixtures for pipeline integration tests
//!
//! - [`MemoryObjectStore`]: paginated in-memory bucket that records downloads
//! - [`Activity`] and [`snapshot_xml`]: SIRI-VM document builder
//! - [`zip_archive`] / [`gzip_archive`]: wrap a document the way the feed does

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sirivm_common::SourceKey;
use sirivm_ingest::storage::{ListPage, ObjectStore, ObjectSummary};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;
use zip::write::SimpleFileOptions;

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sirivm_ingest=debug")
        .try_init();
}

/// Clock reading used by every run in these tests
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 0).unwrap()
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    now() - Duration::minutes(minutes)
}

// ============================================================================
// Object store
// ============================================================================

struct StoredObject {
    last_modified: DateTime<Utc>,
    data: Vec<u8>,
}

/// In-memory bucket served in key order, `page_size` keys per listing page
pub struct MemoryObjectStore {
    objects: BTreeMap<String, StoredObject>,
    page_size: usize,
    fail_listing: bool,
    panic_on: Option<String>,
    downloads: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            objects: BTreeMap::new(),
            page_size,
            fail_listing: false,
            panic_on: None,
            downloads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_object(mut self, key: &str, last_modified: DateTime<Utc>, data: Vec<u8>) -> Self {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                last_modified,
                data,
            },
        );
        self
    }

    /// Make every listing call fail
    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// Panic inside `get` when `key` is downloaded
    pub fn panicking_download(mut self, key: &str) -> Self {
        self.panic_on = Some(key.to_string());
        self
    }

    /// Keys downloaded so far, sorted
    pub fn downloads(&self) -> Vec<String> {
        let mut keys = self.downloads.lock().unwrap().clone();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(&self, prefix: &str, cursor: Option<&str>) -> Result<ListPage> {
        if self.fail_listing {
            return Err(anyhow!("listing denied"));
        }

        let start = cursor.map(|c| c.parse::<usize>()).transpose()?.unwrap_or(0);
        let matching: Vec<_> = self
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect();
        let end = (start + self.page_size).min(matching.len());

        Ok(ListPage {
            objects: matching[start..end]
                .iter()
                .map(|(key, object)| ObjectSummary {
                    key: SourceKey::new(key.as_str()),
                    last_modified: object.last_modified,
                })
                .collect(),
            next_cursor: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn get(&self, key: &SourceKey) -> Result<Vec<u8>> {
        self.downloads.lock().unwrap().push(key.to_string());
        if self.panic_on.as_deref() == Some(key.as_str()) {
            panic!("connection pool corrupted while fetching {}", key);
        }
        self.objects
            .get(key.as_str())
            .map(|object| object.data.clone())
            .ok_or_else(|| anyhow!("NoSuchKey: {}", key))
    }
}

// ============================================================================
// SIRI-VM fixtures
// ============================================================================

/// One `VehicleActivity` to render
#[derive(Debug, Clone)]
pub struct Activity {
    pub operator: &'static str,
    pub vehicle: String,
    pub recorded_at: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Activity {
    pub fn new(vehicle: impl Into<String>, recorded_at: impl Into<String>) -> Self {
        Self {
            operator: "FBRI",
            vehicle: vehicle.into(),
            recorded_at: recorded_at.into(),
            latitude: 51.4494,
            longitude: -2.5851,
        }
    }

    pub fn at(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }

    /// Dedup key the validator derives for this activity
    pub fn dedup_key(&self) -> String {
        let recorded_at = DateTime::parse_from_rfc3339(&self.recorded_at)
            .unwrap()
            .with_timezone(&Utc);
        format!(
            "{}:{}@{}",
            self.operator,
            self.vehicle,
            recorded_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )
    }
}

pub fn snapshot_xml(activities: &[Activity]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Siri xmlns="http://www.siri.org.uk/siri" version="2.0">
  <ServiceDelivery>
    <ResponseTimestamp>2024-01-15T12:00:10+00:00</ResponseTimestamp>
    <VehicleMonitoringDelivery>
"#,
    );
    for a in activities {
        xml.push_str(&format!(
            r#"      <VehicleActivity>
        <RecordedAtTime>{}</RecordedAtTime>
        <MonitoredVehicleJourney>
          <LineRef>72</LineRef>
          <OperatorRef>{}</OperatorRef>
          <VehicleLocation>
            <Longitude>{}</Longitude>
            <Latitude>{}</Latitude>
          </VehicleLocation>
          <Bearing>90</Bearing>
          <VehicleRef>{}</VehicleRef>
        </MonitoredVehicleJourney>
      </VehicleActivity>
"#,
            a.recorded_at, a.operator, a.longitude, a.latitude, a.vehicle
        ));
    }
    xml.push_str("    </VehicleMonitoringDelivery>\n  </ServiceDelivery>\n</Siri>\n");
    xml
}

pub fn zip_archive(xml: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("siri_vm.xml", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

pub fn gzip_archive(xml: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(xml.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// A well-formed archive whose document is cut off mid-element
pub fn malformed_xml_archive() -> Vec<u8> {
    zip_archive("<?xml version=\"1.0\"?>\n<Siri><ServiceDelivery><VehicleMonitoringDelivery>")
}

/// Bytes that look like a zip but are not one
pub fn corrupted_archive() -> Vec<u8> {
    let mut data = b"PK\x03\x04".to_vec();
    data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef].repeat(16));
    data
}
