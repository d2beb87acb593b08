//! Destination store for validated vehicle locations
//!
//! SQLite via `sqlx`. Rows are keyed by their dedup key, so a repeated insert
//! of the same observation is a no-op reported as [`InsertOutcome::AlreadyPresent`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sirivm_common::{DedupKey, VehicleLocation};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// What happened to one insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same dedup key was already stored
    AlreadyPresent,
}

/// Write access to the destination table
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, location: &VehicleLocation) -> Result<InsertOutcome>;

    /// Every dedup key already stored, used to seed the run's cache
    async fn dedup_keys(&self) -> Result<Vec<DedupKey>>;
}

/// SQLite-backed [`RecordStore`]
///
/// The pool holds a single connection; all writes go through the one insert task.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and its schema
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let store = Self::connect(options)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        info!(path = %path.display(), "Opened vehicle location store");
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // An in-memory database lives only as long as its connection
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vehicle_locations (
                dedup_key TEXT PRIMARY KEY,
                source_key TEXT NOT NULL,
                vehicle_ref TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                valid_until TEXT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                bearing REAL,
                item_identifier TEXT,
                line_ref TEXT,
                published_line_name TEXT,
                direction_ref TEXT,
                operator_ref TEXT,
                origin_ref TEXT,
                origin_name TEXT,
                destination_ref TEXT,
                destination_name TEXT,
                origin_aimed_departure TEXT,
                block_ref TEXT,
                journey_ref TEXT,
                inserted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create vehicle_locations table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_vehicle_locations_recorded_at
            ON vehicle_locations(recorded_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create recorded_at index")?;

        debug!("Vehicle location schema initialized");
        Ok(())
    }

    /// Number of stored rows
    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM vehicle_locations")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count.max(0) as u64)
    }

    /// Read back one stored location's position and time
    pub async fn find(&self, key: &DedupKey) -> Result<Option<StoredLocation>> {
        let row = sqlx::query(
            r#"
            SELECT dedup_key, source_key, vehicle_ref, recorded_at, latitude, longitude, bearing
            FROM vehicle_locations WHERE dedup_key = ?1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let recorded_at: String = row.get("recorded_at");
            Ok(StoredLocation {
                dedup_key: DedupKey::from_stored(row.get::<String, _>("dedup_key")),
                source_key: row.get("source_key"),
                vehicle_ref: row.get("vehicle_ref"),
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .with_context(|| format!("Stored recorded_at is not RFC 3339: {}", recorded_at))?
                    .with_timezone(&Utc),
                latitude: row.get("latitude"),
                longitude: row.get("longitude"),
                bearing: row.get("bearing"),
            })
        })
        .transpose()
    }

    /// Flush and close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Subset of a stored row, as read back by [`SqliteStore::find`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLocation {
    pub dedup_key: DedupKey,
    pub source_key: String,
    pub vehicle_ref: String,
    pub recorded_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
}

fn rfc3339(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|ts| ts.to_rfc3339())
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert(&self, location: &VehicleLocation) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO vehicle_locations (
                dedup_key, source_key, vehicle_ref, recorded_at, valid_until,
                latitude, longitude, bearing, item_identifier, line_ref,
                published_line_name, direction_ref, operator_ref, origin_ref, origin_name,
                destination_ref, destination_name, origin_aimed_departure, block_ref, journey_ref
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(location.dedup_key.as_str())
        .bind(location.source.as_str())
        .bind(&location.vehicle_ref)
        .bind(location.recorded_at.to_rfc3339())
        .bind(rfc3339(location.valid_until))
        .bind(location.latitude)
        .bind(location.longitude)
        .bind(location.bearing)
        .bind(&location.item_identifier)
        .bind(&location.line_ref)
        .bind(&location.published_line_name)
        .bind(&location.direction_ref)
        .bind(&location.operator_ref)
        .bind(&location.origin_ref)
        .bind(&location.origin_name)
        .bind(&location.destination_ref)
        .bind(&location.destination_name)
        .bind(rfc3339(location.origin_aimed_departure))
        .bind(&location.block_ref)
        .bind(&location.journey_ref)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert {}", location.dedup_key))?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyPresent)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn dedup_keys(&self) -> Result<Vec<DedupKey>> {
        let rows = sqlx::query("SELECT dedup_key FROM vehicle_locations")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read stored dedup keys")?;

        Ok(rows
            .into_iter()
            .map(|row| DedupKey::from_stored(row.get::<String, _>("dedup_key")))
            .collect())
    }
}
