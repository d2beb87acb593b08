//! SIRI-VM Common Library
//!
//! Shared types, logging, and error handling for the SIRI-VM ingestion workspace.
//!
//! # Overview
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Types**: vehicle location records and the identities that travel with them
//!
//! # Example
//!
//! ```no_run
//! use sirivm_common::logging::{init_logging, LogConfig};
//! use sirivm_common::types::{DedupKey, SourceKey};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let source = SourceKey::new("sirivm/2024/01/15/snapshot_1200.zip");
//!     tracing::info!(source = %source, "Ready");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{DedupKey, SourceKey, VehicleLocation};
