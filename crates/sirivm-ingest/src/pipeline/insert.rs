//! Insert stage: the run's only writer
//!
//! Exactly one task runs this stage. The dedup cache check, the store write and
//! the cache update form a check-then-act sequence that is only race free because
//! nothing else writes concurrently. Raising the writer count requires the cache
//! and the store to gain their own locking or transactional semantics first.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::dedup::DedupCache;
use super::summary::Progress;
use super::types::{StageKind, ValidatedRecord};
use super::worker::panic_message;
use crate::db::{InsertOutcome, RecordStore};
use crate::error::{StageError, StageFailure, StageResult};

pub struct InsertStage {
    store: Arc<dyn RecordStore>,
    cache: DedupCache,
}

impl InsertStage {
    pub fn new(store: Arc<dyn RecordStore>, cache: DedupCache) -> Self {
        Self { store, cache }
    }

    /// Persist one record unless its key is already known
    ///
    /// The cache is updated only after the store confirms the row exists, so a
    /// failed write leaves the key eligible for a later attempt.
    pub async fn process(&mut self, record: &ValidatedRecord) -> StageResult<InsertOutcome> {
        if self.cache.contains(&record.dedup_key) {
            debug!(dedup_key = %record.dedup_key, source = %record.source, "Duplicate skipped");
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let outcome = self.store.insert(record).await.map_err(|e| {
            StageFailure::new(StageKind::Insert, record.source.clone(), StageError::Store(e))
        })?;

        self.cache.record(record.dedup_key.clone());
        Ok(outcome)
    }

    /// Drain `input` until every upstream sender is gone
    pub async fn run(mut self, mut input: mpsc::Receiver<ValidatedRecord>, progress: Progress) -> DedupCache {
        let mut written = 0u64;

        while let Some(record) = input.recv().await {
            // A panicking store call fails this record only; the writer keeps draining
            let result = match AssertUnwindSafe(self.process(&record)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(StageFailure::new(
                    StageKind::Insert,
                    record.source.clone(),
                    StageError::Worker(panic_message(panic)),
                )),
            };

            match result {
                Ok(outcome) => {
                    if outcome == InsertOutcome::Inserted {
                        written += 1;
                    }
                    progress.stored(outcome).await;
                },
                Err(failure) => {
                    warn!(
                        source = %failure.source,
                        stage = %failure.stage,
                        dedup_key = %record.dedup_key,
                        error = %failure.error,
                        "Item dropped"
                    );
                    progress.failed(StageKind::Insert).await;
                },
            }
        }

        info!(written, known_keys = self.cache.len(), "Insert stage drained");
        self.cache
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::summary::ItemEvent;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use sirivm_common::{DedupKey, SourceKey, VehicleLocation};
    use std::sync::Mutex;

    /// Records every insert; fails those for vehicle "broken", panics on "poison"
    #[derive(Default)]
    struct RecordingStore {
        inserted: Mutex<Vec<DedupKey>>,
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        async fn insert(&self, location: &VehicleLocation) -> Result<InsertOutcome> {
            if location.vehicle_ref == "broken" {
                return Err(anyhow!("disk full"));
            }
            if location.vehicle_ref == "poison" {
                panic!("driver bug");
            }
            self.inserted.lock().unwrap().push(location.dedup_key.clone());
            Ok(InsertOutcome::Inserted)
        }

        async fn dedup_keys(&self) -> Result<Vec<DedupKey>> {
            Ok(self.inserted.lock().unwrap().clone())
        }
    }

    fn record(vehicle: &str) -> ValidatedRecord {
        let recorded_at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 5).unwrap();
        VehicleLocation {
            source: SourceKey::new("sirivm/a.zip"),
            dedup_key: DedupKey::new(None, vehicle, recorded_at),
            vehicle_ref: vehicle.to_string(),
            recorded_at,
            valid_until: None,
            latitude: 51.45,
            longitude: -2.58,
            bearing: None,
            item_identifier: None,
            line_ref: None,
            published_line_name: None,
            direction_ref: None,
            operator_ref: None,
            origin_ref: None,
            origin_name: None,
            destination_ref: None,
            destination_name: None,
            origin_aimed_departure: None,
            block_ref: None,
            journey_ref: None,
        }
    }

    #[tokio::test]
    async fn test_second_copy_is_duplicate() {
        let store = Arc::new(RecordingStore::default());
        let mut stage = InsertStage::new(store.clone(), DedupCache::new());

        assert_eq!(stage.process(&record("a")).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            stage.process(&record("a")).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(store.inserted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_seeded_key_never_written() {
        let store = Arc::new(RecordingStore::default());
        let cache: DedupCache = [record("a").dedup_key].into_iter().collect();
        let mut stage = InsertStage::new(store.clone(), cache);

        assert_eq!(
            stage.process(&record("a")).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );
        assert!(store.inserted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_not_cached() {
        let store = Arc::new(RecordingStore::default());
        let mut stage = InsertStage::new(store, DedupCache::new());

        let failure = stage.process(&record("broken")).await.unwrap_err();

        assert_eq!(failure.stage, StageKind::Insert);
        assert!(matches!(failure.error, StageError::Store(_)));
        assert!(!stage.cache.contains(&record("broken").dedup_key));
    }

    #[tokio::test]
    async fn test_run_reports_every_record() {
        let store = Arc::new(RecordingStore::default());
        let stage = InsertStage::new(store, DedupCache::new());
        let (tx, rx) = mpsc::channel(2);
        let (progress, mut events) = Progress::channel(8);

        let writer = tokio::spawn(stage.run(rx, progress));
        for vehicle in ["a", "b", "a", "broken"] {
            tx.send(record(vehicle)).await.unwrap();
        }
        drop(tx);

        let cache = writer.await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }

        assert_eq!(
            seen,
            vec![
                ItemEvent::Stored(InsertOutcome::Inserted),
                ItemEvent::Stored(InsertOutcome::Inserted),
                ItemEvent::Stored(InsertOutcome::AlreadyPresent),
                ItemEvent::Failed { stage: StageKind::Insert },
            ]
        );
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_write_does_not_stop_writer() {
        let store = Arc::new(RecordingStore::default());
        let stage = InsertStage::new(store.clone(), DedupCache::new());
        let (tx, rx) = mpsc::channel(4);
        let (progress, mut events) = Progress::channel(8);

        let writer = tokio::spawn(stage.run(rx, progress));
        for vehicle in ["a", "poison", "b"] {
            tx.send(record(vehicle)).await.unwrap();
        }
        drop(tx);

        let cache = writer.await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }

        assert_eq!(
            seen,
            vec![
                ItemEvent::Stored(InsertOutcome::Inserted),
                ItemEvent::Failed { stage: StageKind::Insert },
                ItemEvent::Stored(InsertOutcome::Inserted),
            ]
        );
        assert_eq!(store.inserted.lock().unwrap().len(), 2);
        assert!(!cache.contains(&record("poison").dedup_key));
    }
}
