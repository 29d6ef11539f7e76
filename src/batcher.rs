//! # Batcher
//!
//! Groups the engine's event stream into batches bounded by count and by time,
//! the same group-commit shape a batch writer uses: collect until the batch is
//! full or the window closes, whichever comes first.
//!
//! ```text
//!  batch_size = 3, batch_timeout = 50ms
//!
//!  t=0   e1 ─┐
//!  t=5   e2  ├─ full ──► [e1 e2 e3]
//!  t=9   e3 ─┘
//!  t=20  e4 ─┐
//!  t=70      └─ timeout ──► [e4]
//!  t=200     (nothing pending: a tick is a no-op)
//! ```
//!
//! ## Rules
//!
//! - The time window opens with the first event of a batch, not on a fixed
//!   clock.
//! - Empty batches are never emitted.
//! - The caught-up signal passes straight through. It does not flush a
//!   partial batch; only size and time do.
//! - A subscription failure flushes the partial batch first (its events have
//!   already advanced the checkpoint), then passes the failure on.
//! - Cancellation discards the partial batch.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::BatchConfig;
use crate::engine::{EngineMessage, SubscriptionFailure};
use crate::filter::EventFilter;
use crate::types::{Batch, RecordedEvent};

/// Capacity of the channel between the batcher and the dispatcher.
///
/// One completed batch may wait while the handler processes the previous
/// one; beyond that the batcher stops pulling from the engine.
pub const PIPELINE_CHANNEL_SIZE: usize = 1;

/// What the batcher hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineMessage {
    Batch(Batch),
    CaughtUp,
    Failed(SubscriptionFailure),
}

enum Wake {
    Deadline,
    Received(Option<EngineMessage>),
    Cancelled,
}

struct PendingBatch {
    events: Vec<RecordedEvent>,
    deadline: Option<Instant>,
    config: BatchConfig,
}

impl PendingBatch {
    fn new(config: BatchConfig) -> Self {
        Self {
            events: Vec::with_capacity(config.batch_size),
            deadline: None,
            config,
        }
    }

    /// Adds an event. Returns true if the batch is now full.
    fn push(&mut self, event: RecordedEvent) -> bool {
        if self.events.is_empty() {
            // An unrepresentable deadline (e.g. `Duration::MAX`) means the
            // batch only ever flushes on size.
            self.deadline = Instant::now().checked_add(self.config.batch_timeout);
        }
        self.events.push(event);
        self.events.len() >= self.config.batch_size
    }

    fn take(&mut self) -> Option<Batch> {
        self.deadline = None;
        Batch::new(std::mem::take(&mut self.events))
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn send(
    output: &mpsc::Sender<PipelineMessage>,
    cancel: &CancellationToken,
    message: PipelineMessage,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = output.send(message) => sent.is_ok(),
    }
}

async fn flush(
    pending: &mut PendingBatch,
    output: &mpsc::Sender<PipelineMessage>,
    cancel: &CancellationToken,
) -> bool {
    match pending.take() {
        Some(batch) => {
            debug!(size = batch.len(), "batch complete");
            send(output, cancel, PipelineMessage::Batch(batch)).await
        }
        None => true,
    }
}

/// Runs the batcher loop until the input closes or `cancel` fires.
pub async fn run_batcher(
    mut input: mpsc::Receiver<EngineMessage>,
    output: mpsc::Sender<PipelineMessage>,
    config: BatchConfig,
    filter: Option<Arc<dyn EventFilter>>,
    cancel: CancellationToken,
) {
    let mut pending = PendingBatch::new(config);

    loop {
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = wait_until(pending.deadline) => Wake::Deadline,
            message = input.recv() => Wake::Received(message),
        };

        let keep_going = match wake {
            Wake::Cancelled => {
                debug!(discarded = pending.events.len(), "batcher cancelled");
                false
            }
            Wake::Deadline => flush(&mut pending, &output, &cancel).await,
            Wake::Received(Some(EngineMessage::Event(event))) => {
                if filter.as_ref().is_some_and(|f| !f.accepts(&event)) {
                    continue;
                }
                if pending.push(event) {
                    flush(&mut pending, &output, &cancel).await
                } else {
                    true
                }
            }
            Wake::Received(Some(EngineMessage::CaughtUp)) => {
                send(&output, &cancel, PipelineMessage::CaughtUp).await
            }
            Wake::Received(Some(EngineMessage::Failed(failure))) => {
                flush(&mut pending, &output, &cancel).await
                    && send(&output, &cancel, PipelineMessage::Failed(failure)).await
            }
            Wake::Received(None) => {
                flush(&mut pending, &output, &cancel).await;
                false
            }
        };

        if !keep_going {
            break;
        }
    }
}

/// Spawns [`run_batcher`] and returns the receiving end of its output.
pub fn spawn_batcher(
    input: mpsc::Receiver<EngineMessage>,
    config: BatchConfig,
    filter: Option<Arc<dyn EventFilter>>,
    cancel: CancellationToken,
) -> (mpsc::Receiver<PipelineMessage>, JoinHandle<()>) {
    let (output, receiver) = mpsc::channel(PIPELINE_CHANNEL_SIZE);
    let task = tokio::spawn(run_batcher(input, output, config, filter, cancel));
    (receiver, task)
}

// =============================================================================
// Tests
// =============================================================================
