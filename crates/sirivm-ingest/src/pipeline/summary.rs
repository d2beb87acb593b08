//! Run accounting
//!
//! Stages never touch the summary directly. They report on a bounded event
//! channel; one aggregator task owns the [`RunSummary`] and applies events in
//! arrival order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::types::StageKind;
use crate::db::InsertOutcome;

/// Outcome of one item in one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEvent {
    /// The stage accepted an item and passed `emitted` items downstream
    Completed { stage: StageKind, emitted: usize },
    /// The item was dropped at this stage
    Failed { stage: StageKind },
    /// The writer reached a terminal state for a validated record
    Stored(InsertOutcome),
}

/// Sending half of the event channel, cloned into every worker
#[derive(Debug, Clone)]
pub struct Progress {
    tx: mpsc::Sender<ItemEvent>,
}

impl Progress {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<ItemEvent>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    pub async fn completed(&self, stage: StageKind, emitted: usize) {
        self.send(ItemEvent::Completed { stage, emitted }).await;
    }

    pub async fn failed(&self, stage: StageKind) {
        self.send(ItemEvent::Failed { stage }).await;
    }

    pub async fn stored(&self, outcome: InsertOutcome) {
        self.send(ItemEvent::Stored(outcome)).await;
    }

    async fn send(&self, event: ItemEvent) {
        if self.tx.send(event).await.is_err() {
            debug!(?event, "Aggregator gone, event discarded");
        }
    }
}

/// Per-stage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Items the stage handled without failing
    pub succeeded: u64,
    /// Items the stage passed downstream
    pub emitted: u64,
    /// Items dropped at this stage
    pub failed: u64,
}

/// Aggregate result of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub cutoff: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Objects selected by the window
    pub found: u64,
    pub inserted: u64,
    pub duplicate: u64,
    /// Items dropped at any stage
    pub failed: u64,

    pub fetch: StageStats,
    pub parse: StageStats,
    pub validate: StageStats,
    pub insert_failed: u64,
}

impl RunSummary {
    pub fn new(run_id: Uuid, cutoff: DateTime<Utc>, found: u64) -> Self {
        Self {
            run_id,
            cutoff,
            started_at: Utc::now(),
            finished_at: None,
            found,
            inserted: 0,
            duplicate: 0,
            failed: 0,
            fetch: StageStats::default(),
            parse: StageStats::default(),
            validate: StageStats::default(),
            insert_failed: 0,
        }
    }

    pub fn apply(&mut self, event: ItemEvent) {
        match event {
            ItemEvent::Completed { stage, emitted } => {
                if let Some(stats) = self.stats_mut(stage) {
                    stats.succeeded += 1;
                    stats.emitted += emitted as u64;
                }
            },
            ItemEvent::Failed { stage } => {
                self.failed += 1;
                match self.stats_mut(stage) {
                    Some(stats) => stats.failed += 1,
                    None => self.insert_failed += 1,
                }
            },
            ItemEvent::Stored(InsertOutcome::Inserted) => self.inserted += 1,
            ItemEvent::Stored(InsertOutcome::AlreadyPresent) => self.duplicate += 1,
        }
    }

    fn stats_mut(&mut self, stage: StageKind) -> Option<&mut StageStats> {
        match stage {
            StageKind::Fetch => Some(&mut self.fetch),
            StageKind::Parse => Some(&mut self.parse),
            StageKind::Validate => Some(&mut self.validate),
            StageKind::Insert => None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Records that reached the writer and ended as inserted or duplicate
    pub fn processed(&self) -> u64 {
        self.inserted + self.duplicate
    }

    /// Every item that entered a stage left it exactly once
    ///
    /// `found` counts objects while the later stages count records, so the
    /// totals are checked stage by stage rather than as one sum.
    pub fn is_consistent(&self) -> bool {
        self.fetch.succeeded + self.fetch.failed == self.found
            && self.parse.succeeded + self.parse.failed == self.fetch.emitted
            && self.validate.succeeded + self.validate.failed == self.parse.emitted
            && self.inserted + self.duplicate + self.insert_failed == self.validate.emitted
            && self.failed
                == self.fetch.failed + self.parse.failed + self.validate.failed + self.insert_failed
    }
}

/// Own `summary` and apply events until every [`Progress`] sender is dropped
pub fn spawn_aggregator(
    mut summary: RunSummary,
    mut events: mpsc::Receiver<ItemEvent>,
) -> JoinHandle<RunSummary> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            summary.apply(event);
        }
        summary
    })
}
