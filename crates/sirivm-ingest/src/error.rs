//! Error types for the ingestion run
//!
//! Two tiers:
//!
//! - [`IngestError`] aborts the run. Only raised before any item enters the
//!   pipeline (listing, store bootstrap, configuration).
//! - [`StageError`] belongs to one item. It is caught at the stage boundary,
//!   logged with the item's source key, and turned into a dropped item.

use sirivm_common::SourceKey;
use thiserror::Error;

use crate::pipeline::StageKind;
use crate::siri::{ParseError, ValidationError};

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Fatal, run-level errors
#[derive(Error, Debug)]
pub enum IngestError {
    /// Listing the source bucket failed; no partial window is trusted
    #[error("Failed to list objects under prefix '{prefix}': {source}")]
    Listing {
        prefix: String,
        #[source]
        source: anyhow::Error,
    },

    /// The destination store could not be opened or read back
    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Per-item errors, one variant per way an item can leave the pipeline early
#[derive(Error, Debug)]
pub enum StageError {
    #[error("download failed: {0:#}")]
    Fetch(#[source] anyhow::Error),

    #[error("decompression failed: {0:#}")]
    Decompress(#[source] anyhow::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("insert failed: {0:#}")]
    Store(#[source] anyhow::Error),

    /// The task running the item panicked or was cancelled
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// The failure half of a stage result: which stage, which object, what went wrong
#[derive(Debug)]
pub struct StageFailure {
    pub stage: StageKind,
    pub source: SourceKey,
    pub error: StageError,
}

impl StageFailure {
    pub fn new(stage: StageKind, source: SourceKey, error: impl Into<StageError>) -> Self {
        Self {
            stage,
            source,
            error: error.into(),
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.source, self.error)
    }
}

/// Result of processing one item in one stage
pub type StageResult<T> = std::result::Result<T, StageFailure>;
