//! SIRI-VM Ingest Library
//!
//! Batch ingestion of SIRI-VM vehicle location snapshots from an S3 bucket into
//! a local SQLite database.
//!
//! # Stages
//!
//! - **Window**: list the bucket and keep objects modified within the lookback
//! - **Fetch**: download and unpack each archive (zip or gzip)
//! - **Parse**: extract `VehicleActivity` records from the XML payload
//! - **Validate**: normalize records and derive their dedup key
//! - **Insert**: write records not seen before, through a single writer
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sirivm_ingest::{
//!     config::IngestConfig,
//!     db::SqliteStore,
//!     pipeline::{Pipeline, RunContext},
//!     siri::{SiriVmParser, SiriVmValidator},
//!     storage::{S3ObjectStore, StorageConfig},
//!     window::WindowSelector,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     config.validate()?;
//!
//!     let context = RunContext {
//!         objects: Arc::new(S3ObjectStore::connect(&StorageConfig::from_env(), &config.bucket).await),
//!         parser: Arc::new(SiriVmParser),
//!         validator: Arc::new(SiriVmValidator::default()),
//!         store: Arc::new(SqliteStore::open(&config.db_path).await?),
//!     };
//!     let selector = WindowSelector::new(&config.prefix, config.lookback());
//!
//!     let summary = Pipeline::new(context, selector, config.concurrency)?.run().await?;
//!     tracing::info!(inserted = summary.inserted, "Run finished");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod decompression;
pub mod error;
pub mod pipeline;
pub mod siri;
pub mod storage;
pub mod window;

pub use error::{IngestError, Result, StageError, StageFailure};
pub use pipeline::{Pipeline, RunContext, RunSummary};
