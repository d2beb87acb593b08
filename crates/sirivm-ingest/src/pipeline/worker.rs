//! Bounded worker pools
//!
//! A pool is a fixed number of tasks sharing one bounded input queue and one
//! bounded output queue. Each worker holds a clone of the output sender, so the
//! downstream queue closes once the input is drained and every worker has exited.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use sirivm_common::SourceKey;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

use super::summary::Progress;
use super::types::StageKind;
use crate::error::{StageError, StageFailure, StageResult};

/// One processing step applied to each item independently
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    const KIND: StageKind;

    /// Object the input was derived from
    fn source(input: &Self::Input) -> &SourceKey;

    /// Turn one input into zero or more outputs, or fail that input alone
    async fn process(&self, input: Self::Input) -> StageResult<Vec<Self::Output>>;
}

/// Render a caught panic payload for a [`StageError::Worker`]
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("panicked: {}", message)
}

/// Process one item, turning a panic into a failure of that item
async fn process_isolated<S: Stage>(stage: &S, item: S::Input) -> StageResult<Vec<S::Output>> {
    let source = S::source(&item).clone();
    match AssertUnwindSafe(stage.process(item)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(StageFailure::new(
            S::KIND,
            source,
            StageError::Worker(panic_message(panic)),
        )),
    }
}

/// Start `workers` tasks draining `input` through `stage` into `output`
pub fn spawn_pool<S: Stage>(
    stage: Arc<S>,
    workers: usize,
    input: mpsc::Receiver<S::Input>,
    output: mpsc::Sender<S::Output>,
    progress: Progress,
) -> Vec<JoinHandle<()>> {
    let input = Arc::new(Mutex::new(input));

    (0..workers)
        .map(|worker| {
            let stage = Arc::clone(&stage);
            let input = Arc::clone(&input);
            let output = output.clone();
            let progress = progress.clone();
            tokio::spawn(run_worker(stage, worker, input, output, progress).in_current_span())
        })
        .collect()
}

async fn run_worker<S: Stage>(
    stage: Arc<S>,
    worker: usize,
    input: Arc<Mutex<mpsc::Receiver<S::Input>>>,
    output: mpsc::Sender<S::Output>,
    progress: Progress,
) {
    let mut handled = 0usize;

    loop {
        // Lock is released as soon as an item (or end of input) is received
        let next = input.lock().await.recv().await;
        let Some(item) = next else {
            break;
        };
        handled += 1;

        match process_isolated(stage.as_ref(), item).await {
            Ok(outputs) => {
                progress.completed(S::KIND, outputs.len()).await;
                for out in outputs {
                    if output.send(out).await.is_err() {
                        error!(stage = %S::KIND, worker, "Downstream queue closed, stopping worker");
                        return;
                    }
                }
            },
            Err(failure) => {
                warn!(
                    source = %failure.source,
                    stage = %failure.stage,
                    error = %failure.error,
                    "Item dropped"
                );
                progress.failed(failure.stage).await;
            },
        }
    }

    debug!(stage = %S::KIND, worker, handled, "Worker finished");
}

/// Wait for every task of a pool, logging any that died
pub async fn join_pool(kind: StageKind, handles: Vec<JoinHandle<()>>) {
    for result in join_all(handles).await {
        if let Err(e) = result {
            error!(stage = %kind, error = %e, "Worker task failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::summary::{spawn_aggregator, RunSummary};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct Item {
        source: SourceKey,
        n: usize,
    }

    fn item(n: usize) -> Item {
        Item {
            source: SourceKey::new(format!("sirivm/{n}.zip")),
            n,
        }
    }

    /// Emits `n` copies of `n`; fails on zero, panics on 99
    struct Repeat;

    #[async_trait]
    impl Stage for Repeat {
        type Input = Item;
        type Output = usize;

        const KIND: StageKind = StageKind::Parse;

        fn source(input: &Item) -> &SourceKey {
            &input.source
        }

        async fn process(&self, input: Item) -> StageResult<Vec<usize>> {
            match input.n {
                0 => Err(StageFailure::new(
                    StageKind::Parse,
                    input.source,
                    StageError::Worker("zero".to_string()),
                )),
                99 => panic!("cannot repeat {}", input.n),
                n => Ok(vec![n; n]),
            }
        }
    }

    /// Passes items through, counting how many it has taken from its input
    struct Counting {
        taken: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Counting {
        type Input = Item;
        type Output = usize;

        const KIND: StageKind = StageKind::Fetch;

        fn source(input: &Item) -> &SourceKey {
            &input.source
        }

        async fn process(&self, input: Item) -> StageResult<Vec<usize>> {
            self.taken.fetch_add(1, Ordering::SeqCst);
            Ok(vec![input.n])
        }
    }

    #[tokio::test]
    async fn test_pool_drains_and_closes_output() {
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(2);
        let (progress, events) = Progress::channel(4);
        let aggregator = spawn_aggregator(RunSummary::new(Uuid::new_v4(), Utc::now(), 4), events);

        let handles = spawn_pool(Arc::new(Repeat), 3, in_rx, out_tx, progress);

        let feeder = tokio::spawn(async move {
            for i in [1usize, 0, 3, 2] {
                in_tx.send(item(i)).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Some(v) = out_rx.recv().await {
            received.push(v);
        }
        feeder.await.unwrap();
        join_pool(StageKind::Parse, handles).await;

        received.sort_unstable();
        assert_eq!(received, vec![1, 2, 2, 3, 3, 3]);

        let summary = aggregator.await.unwrap();
        assert_eq!(summary.parse.succeeded, 3);
        assert_eq!(summary.parse.emitted, 6);
        assert_eq!(summary.parse.failed, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_item_is_counted_and_worker_survives() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (progress, events) = Progress::channel(8);
        let aggregator = spawn_aggregator(RunSummary::new(Uuid::new_v4(), Utc::now(), 3), events);

        // One worker: the items after the panic are only handled if it survives
        let handles = spawn_pool(Arc::new(Repeat), 1, in_rx, out_tx, progress);
        for i in [99usize, 2, 1] {
            in_tx.send(item(i)).await.unwrap();
        }
        drop(in_tx);

        let mut received = Vec::new();
        while let Some(v) = out_rx.recv().await {
            received.push(v);
        }
        join_pool(StageKind::Parse, handles).await;

        assert_eq!(received, vec![2, 2, 1]);
        let summary = aggregator.await.unwrap();
        assert_eq!(summary.parse.succeeded, 2);
        assert_eq!(summary.parse.failed, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_panic_keeps_item_identity() {
        let failure = process_isolated(&Repeat, item(99)).await.unwrap_err();

        assert_eq!(failure.stage, StageKind::Parse);
        assert_eq!(failure.source.as_str(), "sirivm/99.zip");
        match failure.error {
            StageError::Worker(message) => assert_eq!(message, "panicked: cannot repeat 99"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_output_queue_stops_intake() {
        const WORKERS: usize = 2;
        const OUTPUT_DEPTH: usize = 2;

        let taken = Arc::new(AtomicUsize::new(0));
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(OUTPUT_DEPTH);
        let (progress, mut events) = Progress::channel(64);
        let drain_events = tokio::spawn(async move { while events.recv().await.is_some() {} });

        let stage = Counting {
            taken: Arc::clone(&taken),
        };
        let handles = spawn_pool(Arc::new(stage), WORKERS, in_rx, out_tx, progress);

        let feeder = tokio::spawn(async move {
            for i in 1..=20usize {
                in_tx.send(item(i)).await.unwrap();
            }
        });

        // Nobody reads the output; the paused clock only advances once every task is parked
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(taken.load(Ordering::SeqCst), WORKERS + OUTPUT_DEPTH);
        assert!(!feeder.is_finished());

        let mut received = Vec::new();
        while let Some(v) = out_rx.recv().await {
            received.push(v);
        }
        feeder.await.unwrap();
        join_pool(StageKind::Fetch, handles).await;
        drain_events.await.unwrap();

        received.sort_unstable();
        assert_eq!(received, (1..=20).collect::<Vec<_>>());
        assert_eq!(taken.load(Ordering::SeqCst), 20);
    }
}
