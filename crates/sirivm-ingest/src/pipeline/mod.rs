//! Ingestion pipeline orchestration
//!
//! ```text
//! window ─▶ [fetch ×N] ─▶ [parse ×N] ─▶ [validate ×N] ─▶ [insert ×1]
//!                │             │              │               │
//!                └─────────────┴──── progress events ─────────┴─▶ aggregator ─▶ RunSummary
//! ```
//!
//! Every arrow is a bounded `mpsc` queue. A full queue blocks the producing
//! stage. A stage closes its output once its input is exhausted and all its
//! workers have returned, so the run ends when the writer sees its input close.

pub mod dedup;
pub mod insert;
pub mod stages;
pub mod summary;
pub mod types;
pub mod worker;

pub use dedup::DedupCache;
pub use insert::InsertStage;
pub use stages::{FetchStage, ParseStage, ValidateStage};
pub use summary::{ItemEvent, Progress, RunSummary, StageStats};
pub use types::{RawPayload, StageKind, ValidatedRecord};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::StageConcurrency;
use crate::db::RecordStore;
use crate::error::{IngestError, Result};
use crate::siri::{RecordParser, RecordValidator};
use crate::storage::ObjectStore;
use crate::window::{Window, WindowSelector};
use worker::{join_pool, spawn_pool};

/// Collaborators shared by every stage of one run
///
/// Built once by the caller and passed down; stages hold `Arc` clones.
#[derive(Clone)]
pub struct RunContext {
    pub objects: Arc<dyn ObjectStore>,
    pub parser: Arc<dyn RecordParser>,
    pub validator: Arc<dyn RecordValidator>,
    pub store: Arc<dyn RecordStore>,
}

pub struct Pipeline {
    context: RunContext,
    selector: WindowSelector,
    concurrency: StageConcurrency,
}

impl Pipeline {
    pub fn new(
        context: RunContext,
        selector: WindowSelector,
        concurrency: StageConcurrency,
    ) -> Result<Self> {
        concurrency.validate()?;
        Ok(Self {
            context,
            selector,
            concurrency,
        })
    }

    pub fn selector(&self) -> &WindowSelector {
        &self.selector
    }

    /// Run once against the current clock
    pub async fn run(&self) -> Result<RunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Run once with the window computed from `now`
    ///
    /// Only listing and store bootstrap failures are returned as errors; every
    /// item-level failure ends up in the summary.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run", %run_id);

        async move {
            // Fatal errors are reported once, by the caller
            let window = self.selector.select(self.context.objects.as_ref(), now).await?;

            let cache = DedupCache::load(self.context.store.as_ref())
                .await
                .map_err(IngestError::Store)?;

            let summary = self.drain(run_id, started_at, window, cache).await;

            info!(
                found = summary.found,
                inserted = summary.inserted,
                duplicate = summary.duplicate,
                failed = summary.failed,
                "Run complete"
            );
            if !summary.is_consistent() {
                warn!(?summary, "Run summary counts do not reconcile");
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Push every window object through the stages and wait for the writer
    async fn drain(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        window: Window,
        cache: DedupCache,
    ) -> RunSummary {
        let c = self.concurrency;
        let Window { cutoff, objects, .. } = window;
        let found = objects.len() as u64;

        let mut initial = RunSummary::new(run_id, cutoff, found);
        initial.started_at = started_at;

        let (progress, events) = Progress::channel(c.queue_depth);
        let aggregator = summary::spawn_aggregator(initial.clone(), events);

        let (object_tx, object_rx) = mpsc::channel(c.fetch_queue_depth);
        let (payload_tx, payload_rx) = mpsc::channel(c.queue_depth);
        let (parsed_tx, parsed_rx) = mpsc::channel(c.queue_depth);
        let (valid_tx, valid_rx) = mpsc::channel(c.queue_depth);

        let feeder = tokio::spawn(
            async move {
                for object in objects {
                    if object_tx.send(object).await.is_err() {
                        error!("Fetch queue closed before the window was fed");
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        let fetch = spawn_pool(
            Arc::new(FetchStage::new(Arc::clone(&self.context.objects))),
            c.fetch_workers,
            object_rx,
            payload_tx,
            progress.clone(),
        );
        let parse = spawn_pool(
            Arc::new(ParseStage::new(Arc::clone(&self.context.parser))),
            c.parse_workers,
            payload_rx,
            parsed_tx,
            progress.clone(),
        );
        let validate = spawn_pool(
            Arc::new(ValidateStage::new(Arc::clone(&self.context.validator))),
            c.validate_workers,
            parsed_rx,
            valid_tx,
            progress.clone(),
        );

        // Single writer: see `InsertStage`. `insert_workers` is validated to be 1.
        let writer = tokio::spawn(
            InsertStage::new(Arc::clone(&self.context.store), cache)
                .run(valid_rx, progress)
                .in_current_span(),
        );

        if let Err(e) = feeder.await {
            error!(error = %e, "Window feeder failed");
        }
        join_pool(StageKind::Fetch, fetch).await;
        join_pool(StageKind::Parse, parse).await;
        join_pool(StageKind::Validate, validate).await;
        if let Err(e) = writer.await {
            error!(error = %e, "Insert stage failed");
        }

        let mut summary = match aggregator.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Summary aggregator failed");
                initial
            },
        };
        summary.finish();
        summary
    }
}
