//! Fetch, parse and validate stages
//!
//! Fetch is I/O bound and runs on the async runtime; decompression, parsing and
//! validation are CPU bound and run on the blocking pool.

use async_trait::async_trait;
use sirivm_common::SourceKey;
use std::sync::Arc;
use tracing::debug;

use super::types::{RawPayload, StageKind, ValidatedRecord};
use super::worker::Stage;
use crate::decompression::extract_payload;
use crate::error::{StageError, StageFailure, StageResult};
use crate::siri::{ParsedRecord, RecordParser, RecordValidator};
use crate::storage::ObjectStore;
use crate::window::SourceObjectDescriptor;

/// Run `f` on the blocking pool, attributing a panic to `source`
async fn run_blocking<T, F>(stage: StageKind, source: &SourceKey, f: F) -> StageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(StageFailure::new(stage, source.clone(), error)),
        Err(join) => Err(StageFailure::new(
            stage,
            source.clone(),
            StageError::Worker(join.to_string()),
        )),
    }
}

/// Download one object and unpack its payload
pub struct FetchStage {
    store: Arc<dyn ObjectStore>,
}

impl FetchStage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for FetchStage {
    type Input = SourceObjectDescriptor;
    type Output = RawPayload;

    const KIND: StageKind = StageKind::Fetch;

    fn source(object: &SourceObjectDescriptor) -> &SourceKey {
        &object.key
    }

    async fn process(&self, object: SourceObjectDescriptor) -> StageResult<Vec<RawPayload>> {
        let source = object.key;

        let archive = self
            .store
            .get(&source)
            .await
            .map_err(|e| StageFailure::new(Self::KIND, source.clone(), StageError::Fetch(e)))?;

        let bytes = run_blocking(Self::KIND, &source, move || {
            extract_payload(&archive).map_err(StageError::Decompress)
        })
        .await?;

        debug!(source = %source, bytes = bytes.len(), "Fetched payload");
        Ok(vec![RawPayload { source, bytes }])
    }
}

/// Split a payload into parsed records
pub struct ParseStage {
    parser: Arc<dyn RecordParser>,
}

impl ParseStage {
    pub fn new(parser: Arc<dyn RecordParser>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl Stage for ParseStage {
    type Input = RawPayload;
    type Output = ParsedRecord;

    const KIND: StageKind = StageKind::Parse;

    fn source(payload: &RawPayload) -> &SourceKey {
        &payload.source
    }

    async fn process(&self, payload: RawPayload) -> StageResult<Vec<ParsedRecord>> {
        let parser = Arc::clone(&self.parser);
        let source = payload.source.clone();

        let records = run_blocking(Self::KIND, &source, move || {
            parser
                .parse(&payload.source, &payload.bytes)
                .map_err(StageError::from)
        })
        .await?;

        if records.is_empty() {
            debug!(source = %source, "Payload holds no vehicle activity");
        }
        Ok(records)
    }
}

/// Check and normalize one parsed record
pub struct ValidateStage {
    validator: Arc<dyn RecordValidator>,
}

impl ValidateStage {
    pub fn new(validator: Arc<dyn RecordValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Stage for ValidateStage {
    type Input = ParsedRecord;
    type Output = ValidatedRecord;

    const KIND: StageKind = StageKind::Validate;

    fn source(record: &ParsedRecord) -> &SourceKey {
        &record.source
    }

    async fn process(&self, record: ParsedRecord) -> StageResult<Vec<ValidatedRecord>> {
        let validator = Arc::clone(&self.validator);
        let source = record.source.clone();

        let location = run_blocking(Self::KIND, &source, move || {
            validator.validate(record).map_err(StageError::from)
        })
        .await?;

        Ok(vec![location])
    }
}
