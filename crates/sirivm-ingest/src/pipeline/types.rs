//! Items handed between stages

use serde::Serialize;
use sirivm_common::{SourceKey, VehicleLocation};
use std::fmt;

/// Pipeline stage, as reported in logs and failure counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Fetch,
    Parse,
    Validate,
    Insert,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Fetch => "fetch",
            StageKind::Parse => "parse",
            StageKind::Validate => "validate",
            StageKind::Insert => "insert",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decompressed contents of one source object
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub source: SourceKey,
    pub bytes: Vec<u8>,
}

/// A record that passed validation, carrying its dedup key
pub type ValidatedRecord = VehicleLocation;
