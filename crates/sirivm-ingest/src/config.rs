//! Run configuration
//!
//! Loaded from the environment (after `.env` via `dotenvy`), then optionally
//! overridden from the command line.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Default key prefix of snapshot objects in the bucket.
pub const DEFAULT_PREFIX: &str = "sirivm";

/// Default extraction window in hours.
pub const DEFAULT_LOOKBACK_HOURS: f64 = 1.0;

/// Default SQLite database file.
pub const DEFAULT_DB_PATH: &str = "vehicles.db";

/// Concurrent downloads.
pub const DEFAULT_FETCH_WORKERS: usize = 5;

/// Depth of the queue feeding the fetch workers.
pub const DEFAULT_FETCH_QUEUE_DEPTH: usize = 5;

/// Parser workers (CPU bound, run on the blocking pool).
pub const DEFAULT_PARSE_WORKERS: usize = 4;

/// Validator workers (CPU bound, run on the blocking pool).
pub const DEFAULT_VALIDATE_WORKERS: usize = 4;

/// Depth of the parse/validate/insert hand-off queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// The store writer count. Fixed: see [`StageConcurrency::insert_workers`].
pub const INSERT_WORKERS: usize = 1;

/// Worker counts and queue depths per stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConcurrency {
    pub fetch_workers: usize,
    pub fetch_queue_depth: usize,
    pub parse_workers: usize,
    pub validate_workers: usize,
    pub queue_depth: usize,

    /// Number of store writers. Must be 1: the dedup cache and the store rely on a
    /// single writer for their check-then-insert sequence and have no locking of
    /// their own.
    pub insert_workers: usize,
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            fetch_workers: DEFAULT_FETCH_WORKERS,
            fetch_queue_depth: DEFAULT_FETCH_QUEUE_DEPTH,
            parse_workers: DEFAULT_PARSE_WORKERS,
            validate_workers: DEFAULT_VALIDATE_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            insert_workers: INSERT_WORKERS,
        }
    }
}

impl StageConcurrency {
    /// One worker and a queue depth of one everywhere
    pub fn sequential() -> Self {
        Self {
            fetch_workers: 1,
            fetch_queue_depth: 1,
            parse_workers: 1,
            validate_workers: 1,
            queue_depth: 1,
            insert_workers: INSERT_WORKERS,
        }
    }

    /// `workers` workers for every stage that may run in parallel
    pub fn uniform(workers: usize, queue_depth: usize) -> Self {
        Self {
            fetch_workers: workers,
            fetch_queue_depth: queue_depth,
            parse_workers: workers,
            validate_workers: workers,
            queue_depth,
            insert_workers: INSERT_WORKERS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("fetch_workers", self.fetch_workers),
            ("fetch_queue_depth", self.fetch_queue_depth),
            ("parse_workers", self.parse_workers),
            ("validate_workers", self.validate_workers),
            ("queue_depth", self.queue_depth),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(IngestError::config(format!("{} must be greater than 0", name)));
            }
        }

        if self.insert_workers != INSERT_WORKERS {
            return Err(IngestError::config(format!(
                "insert_workers must be {} (got {}): store writes are serialized through a single writer",
                INSERT_WORKERS, self.insert_workers
            )));
        }

        Ok(())
    }
}

/// Ingestion run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Source bucket
    pub bucket: String,

    /// Only keys under this prefix are considered
    pub prefix: String,

    /// Width of the extraction window: objects modified after `now - lookback` are selected
    pub lookback_hours: f64,

    /// SQLite database file
    pub db_path: PathBuf,

    /// Append a `_%Y%m%d_%H%M%S` stamp to the database file name
    pub timestamped_db: bool,

    /// Page size requested from the listing API (server default when unset)
    pub list_page_size: Option<i32>,

    pub concurrency: StageConcurrency,
}

impl IngestConfig {
    /// Load configuration from `.env` and the process environment
    ///
    /// - `S3_BUCKET` (required)
    /// - `SIRIVM_PREFIX`, `SIRIVM_LOOKBACK_HOURS`, `SIRIVM_DB_PATH`,
    ///   `SIRIVM_DB_TIMESTAMPED`, `SIRIVM_LIST_PAGE_SIZE`
    /// - `SIRIVM_FETCH_WORKERS`, `SIRIVM_FETCH_QUEUE_DEPTH`, `SIRIVM_PARSE_WORKERS`,
    ///   `SIRIVM_VALIDATE_WORKERS`, `SIRIVM_QUEUE_DEPTH`, `SIRIVM_INSERT_WORKERS`
    ///
    /// The result is not validated yet so that CLI overrides can be applied first.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            bucket: std::env::var("S3_BUCKET").unwrap_or_default(),
            prefix: std::env::var("SIRIVM_PREFIX").unwrap_or_else(|_| DEFAULT_PREFIX.to_string()),
            lookback_hours: env_parse("SIRIVM_LOOKBACK_HOURS")?.unwrap_or(DEFAULT_LOOKBACK_HOURS),
            db_path: std::env::var("SIRIVM_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
            timestamped_db: env_parse("SIRIVM_DB_TIMESTAMPED")?.unwrap_or(false),
            list_page_size: env_parse("SIRIVM_LIST_PAGE_SIZE")?,
            concurrency: StageConcurrency {
                fetch_workers: env_parse("SIRIVM_FETCH_WORKERS")?.unwrap_or(DEFAULT_FETCH_WORKERS),
                fetch_queue_depth: env_parse("SIRIVM_FETCH_QUEUE_DEPTH")?
                    .unwrap_or(DEFAULT_FETCH_QUEUE_DEPTH),
                parse_workers: env_parse("SIRIVM_PARSE_WORKERS")?.unwrap_or(DEFAULT_PARSE_WORKERS),
                validate_workers: env_parse("SIRIVM_VALIDATE_WORKERS")?
                    .unwrap_or(DEFAULT_VALIDATE_WORKERS),
                queue_depth: env_parse("SIRIVM_QUEUE_DEPTH")?.unwrap_or(DEFAULT_QUEUE_DEPTH),
                insert_workers: env_parse("SIRIVM_INSERT_WORKERS")?.unwrap_or(INSERT_WORKERS),
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(IngestError::config("S3_BUCKET must be set"));
        }

        if !self.lookback_hours.is_finite() || self.lookback_hours <= 0.0 {
            return Err(IngestError::config(format!(
                "lookback_hours must be a positive number (got {})",
                self.lookback_hours
            )));
        }

        if let Some(size) = self.list_page_size {
            if !(1..=1000).contains(&size) {
                return Err(IngestError::config(format!(
                    "list_page_size must be between 1 and 1000 (got {})",
                    size
                )));
            }
        }

        if self.db_path.as_os_str().is_empty() {
            return Err(IngestError::config("db_path cannot be empty"));
        }

        self.concurrency.validate()
    }

    /// Lookback as a chrono duration (millisecond precision)
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.lookback_hours * 3_600_000.0).round() as i64)
    }

    /// Database path for a run started at `started`, honoring `timestamped_db`
    pub fn resolved_db_path(&self, started: DateTime<Local>) -> PathBuf {
        if self.timestamped_db {
            timestamped_path(&self.db_path, started)
        } else {
            self.db_path.clone()
        }
    }
}

/// `vehicles.db` -> `vehicles_20240115_120000.db`
fn timestamped_path(path: &Path, started: DateTime<Local>) -> PathBuf {
    let stamp = started.format("%Y%m%d_%H%M%S");
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vehicles".to_string());
    let file_name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}_{}", stem, stamp),
    };
    path.with_file_name(file_name)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestError::config(format!("{} has an invalid value: '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
