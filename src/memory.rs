//! # In-Memory Event Store
//!
//! A complete in-process implementation of the
//! [`EventStoreClient`] capability: an append-only log plus a broadcast
//! channel for the live tail. It backs the test suite and the demo binary,
//! and is a reference for adapters to real stores.
//!
//! ## The Catch-Up + Live Handoff
//!
//! ```text
//!  subscribe(from = 100)             head = 500
//!       │                                 │
//!       ▼                                 ▼
//!  ┌────────────────────────────┐  ┌────────────────────────────┐
//!  │ Phase 1: replay 101..=500  │  │ Phase 2: live 501+         │
//!  │ from the log snapshot      │  │ via broadcast receiver     │
//!  └────────────────────────────┘  └────────────────────────────┘
//! ```
//!
//! The broadcast receiver is created under the same lock that captures the
//! snapshot, so no event falls between the two phases. Live events at or
//! before the last replayed position are skipped.
//!
//! ## Backpressure
//!
//! Catch-up is paced by the consumer: each event waits for room in the sink.
//! Live delivery is not: if the sink is full, or the broadcast receiver lags,
//! the subscription is dropped with [`DropReason::ProcessingQueueOverflow`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{CatchUpSettings, EventStoreClient, StoreMessage, StoreSubscription};
use crate::types::{DropReason, EventId, Position, RecordedEvent, StreamId};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity for the live broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 10_000;

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct Log {
    events: Vec<RecordedEvent>,
    stream_revisions: HashMap<StreamId, u64>,
}

struct StoreInner {
    log: RwLock<Log>,
    live_tx: broadcast::Sender<RecordedEvent>,
}

/// Append-only in-memory log with catch-up subscriptions.
///
/// `Clone` is cheap; all clones share the same log.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<StoreInner>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl InMemoryEventStore {
    /// Creates an empty store whose live tail buffers `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (live_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(StoreInner {
                log: RwLock::new(Log::default()),
                live_tx,
            }),
        }
    }

    /// Appends an event with a fresh id to `stream_id`.
    pub fn append(
        &self,
        stream_id: impl Into<StreamId>,
        event_type: impl Into<String>,
        data: Vec<u8>,
    ) -> RecordedEvent {
        self.append_with_id(EventId::new(), stream_id, event_type, data)
    }

    /// Appends an event with a caller-chosen id.
    ///
    /// The store does not enforce id uniqueness, so this is also how a test
    /// plants a duplicate in the log.
    pub fn append_with_id(
        &self,
        event_id: EventId,
        stream_id: impl Into<StreamId>,
        event_type: impl Into<String>,
        data: Vec<u8>,
    ) -> RecordedEvent {
        let stream_id = stream_id.into();
        let mut log = self.inner.log.write();

        let next = log.events.len() as u64 + 1;
        let revision = log.stream_revisions.entry(stream_id.clone()).or_insert(0);
        let event_number = *revision;
        *revision += 1;

        let event = RecordedEvent::new(stream_id, event_number, event_type, data, Position::new(next, next))
            .with_id(event_id);
        log.events.push(event.clone());

        // Broadcast while holding the write lock so a concurrent subscribe
        // sees the event either in its snapshot or on its receiver, never both
        // and never neither. No receivers is not an error.
        let _ = self.inner.live_tx.send(event.clone());
        event
    }

    /// Position of the last event, or [`Position::START`] for an empty log.
    pub fn tail_position(&self) -> Position {
        self.inner
            .log
            .read()
            .events
            .last()
            .map(|e| e.position)
            .unwrap_or(Position::START)
    }

    /// Number of events in the log.
    pub fn len(&self) -> usize {
        self.inner.log.read().events.len()
    }

    /// Returns true if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscriptions currently attached to the live tail.
    pub fn subscriber_count(&self) -> usize {
        self.inner.live_tx.receiver_count()
    }

    fn snapshot_and_subscribe(
        &self,
        from: Option<Position>,
    ) -> (Vec<RecordedEvent>, broadcast::Receiver<RecordedEvent>) {
        let log = self.inner.log.read();
        let receiver = self.inner.live_tx.subscribe();
        let snapshot = log
            .events
            .iter()
            .filter(|e| from.map_or(true, |f| e.position.is_after(&f)))
            .cloned()
            .collect();
        (snapshot, receiver)
    }
}

impl EventStoreClient for InMemoryEventStore {
    fn read_tail_position(&self) -> BoxFuture<'_, Result<Position>> {
        let tail = self.tail_position();
        Box::pin(async move { Ok(tail) })
    }

    fn subscribe_to_all(
        &self,
        from: Option<Position>,
        settings: CatchUpSettings,
        sink: mpsc::Sender<StoreMessage>,
    ) -> BoxFuture<'_, Result<Box<dyn StoreSubscription>>> {
        let (snapshot, receiver) = self.snapshot_and_subscribe(from);
        Box::pin(async move {
            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_subscription(
                snapshot,
                receiver,
                from,
                settings,
                sink,
                cancel.clone(),
            ));
            Ok(Box::new(MemorySubscription { cancel, task }) as Box<dyn StoreSubscription>)
        })
    }
}

// =============================================================================
// Subscription Task
// =============================================================================

struct MemorySubscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StoreSubscription for MemorySubscription {
    fn stop(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        self.cancel.cancel();
        let task = self.task;
        Box::pin(async move {
            task.await
                .map_err(|e| Error::Store(format!("subscription task failed: {}", e)))
        })
    }
}

/// Sends `message`, waiting for room. Returns false if the subscription was
/// cancelled or the consumer went away.
async fn deliver(
    sink: &mpsc::Sender<StoreMessage>,
    cancel: &CancellationToken,
    message: StoreMessage,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = sink.send(message) => sent.is_ok(),
    }
}

async fn run_subscription(
    snapshot: Vec<RecordedEvent>,
    mut live: broadcast::Receiver<RecordedEvent>,
    from: Option<Position>,
    settings: CatchUpSettings,
    sink: mpsc::Sender<StoreMessage>,
    cancel: CancellationToken,
) {
    let mut last = from;

    // Phase 1: catch-up, one read page at a time.
    for page in snapshot.chunks(settings.read_batch_size.max(1)) {
        for event in page {
            if !deliver(&sink, &cancel, StoreMessage::Event(event.clone())).await {
                return;
            }
            last = Some(event.position);
        }
    }

    if !deliver(&sink, &cancel, StoreMessage::LiveProcessingStarted).await {
        return;
    }
    debug!(checkpoint = ?last, "in-memory subscription is live");

    // Phase 2: live tail.
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = live.recv() => received,
        };

        match received {
            Ok(event) => {
                if last.is_some_and(|l| !event.position.is_after(&l)) {
                    continue;
                }
                last = Some(event.position);

                match sink.try_send(StoreMessage::Event(event)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let dropped = StoreMessage::Dropped {
                            reason: DropReason::ProcessingQueueOverflow,
                            error: Some(format!(
                                "live queue exceeded {} events",
                                settings.max_live_queue_size
                            )),
                        };
                        deliver(&sink, &cancel, dropped).await;
                        return;
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                let dropped = StoreMessage::Dropped {
                    reason: DropReason::ProcessingQueueOverflow,
                    error: Some(format!("live tail lagged by {} events", n)),
                };
                deliver(&sink, &cancel, dropped).await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => {
                let dropped = StoreMessage::Dropped {
                    reason: DropReason::ConnectionClosed,
                    error: None,
                };
                deliver(&sink, &cancel, dropped).await;
                return;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
