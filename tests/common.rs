#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use spitefeed::{
    Batch, CatchUpSettings, DropReason, Error, EventStoreClient, HandlerResult, Position,
    RecordedEvent, Result, StoreMessage, StoreSubscription, TriggerHandler,
};
use tokio::sync::mpsc;

// =============================================================================
// Scripted Store
// =============================================================================

#[derive(Default)]
struct ScriptState {
    tail: Option<Position>,
    subscribe_error: Option<String>,
    calls: Vec<(Option<Position>, CatchUpSettings)>,
    sinks: Vec<mpsc::Sender<StoreMessage>>,
}

/// A store whose push stream is driven by the test.
///
/// Every `subscribe_to_all` call is recorded and its sink kept, so a test can
/// push messages into any subscription instance and inspect where each one
/// started from.
#[derive(Default)]
pub struct ScriptedStore {
    state: Mutex<ScriptState>,
    stops: Arc<AtomicUsize>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_tail(tail: Position) -> Arc<Self> {
        let store = Self::default();
        store.state.lock().tail = Some(tail);
        Arc::new(store)
    }

    /// Makes every following subscribe call fail.
    pub fn fail_subscribes(&self, message: &str) {
        self.state.lock().subscribe_error = Some(message.to_string());
    }

    pub fn subscribe_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Start positions of every subscribe call, in order.
    pub fn subscribed_from(&self) -> Vec<Option<Position>> {
        self.state.lock().calls.iter().map(|(from, _)| *from).collect()
    }

    pub fn settings(&self, n: usize) -> CatchUpSettings {
        self.state.lock().calls[n].1
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Waits for the `n`-th subscription (0-based) and returns its sink.
    pub async fn sink(&self, n: usize) -> mpsc::Sender<StoreMessage> {
        eventually(Duration::from_secs(2), Duration::from_millis(5), || {
            self.state.lock().sinks.get(n).cloned()
        })
        .await
    }

    /// Pushes into the `n`-th subscription.
    pub async fn push(&self, n: usize, message: StoreMessage) {
        self.sink(n)
            .await
            .send(message)
            .await
            .expect("engine is consuming the subscription");
    }

    /// Drops every sink the store holds, closing the push streams without a
    /// drop notice.
    pub fn disconnect(&self) {
        self.state.lock().sinks.clear();
    }
}

struct ScriptedSubscription {
    stops: Arc<AtomicUsize>,
}

impl StoreSubscription for ScriptedSubscription {
    fn stop(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

impl EventStoreClient for ScriptedStore {
    fn read_tail_position(&self) -> BoxFuture<'_, Result<Position>> {
        let tail = self.state.lock().tail;
        Box::pin(async move { tail.ok_or_else(|| Error::Store("tail unavailable".to_string())) })
    }

    fn subscribe_to_all(
        &self,
        from: Option<Position>,
        settings: CatchUpSettings,
        sink: mpsc::Sender<StoreMessage>,
    ) -> BoxFuture<'_, Result<Box<dyn StoreSubscription>>> {
        let result = {
            let mut state = self.state.lock();
            state.calls.push((from, settings));
            match state.subscribe_error.clone() {
                Some(message) => Err(Error::Store(message)),
                None => {
                    state.sinks.push(sink);
                    Ok(Box::new(ScriptedSubscription {
                        stops: Arc::clone(&self.stops),
                    }) as Box<dyn StoreSubscription>)
                }
            }
        };
        Box::pin(async move { result })
    }
}

// =============================================================================
// Events
// =============================================================================

pub fn event(stream: &str, commit: u64) -> RecordedEvent {
    RecordedEvent::new(stream, commit, "Happened", commit.to_le_bytes().to_vec(), Position::new(commit, commit))
}

pub fn typed_event(stream: &str, event_type: &str, commit: u64) -> RecordedEvent {
    RecordedEvent::new(stream, commit, event_type, Vec::new(), Position::new(commit, commit))
}

pub fn commits(events: &[RecordedEvent]) -> Vec<u64> {
    events.iter().map(|e| e.position.commit_position()).collect()
}

// =============================================================================
// Recording Handler
// =============================================================================

/// Records everything the listener hands it.
#[derive(Default)]
pub struct RecordingHandler {
    batches: Mutex<Vec<Batch>>,
    caught_up: AtomicUsize,
    errors: Mutex<Vec<(DropReason, Option<String>)>>,
    delay: Option<Duration>,
    fail_first: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleeps for `delay` inside every batch call.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Returns an error from the first `n` batch calls (the batches are still
    /// recorded).
    pub fn failing_first(n: usize) -> Arc<Self> {
        let handler = Self::default();
        handler.fail_first.store(n, Ordering::SeqCst);
        Arc::new(handler)
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.batches.lock().iter().map(|b| b.len()).sum()
    }

    pub fn caught_up(&self) -> usize {
        self.caught_up.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<(DropReason, Option<String>)> {
        self.errors.lock().clone()
    }
}

impl TriggerHandler for RecordingHandler {
    fn on_batch(&self, batch: Batch) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.batches.lock().push(batch);

            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err("projection rejected batch".into());
            }
            Ok(())
        })
    }

    fn on_caught_up(&self) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            self.caught_up.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn on_error(&self, reason: DropReason, detail: Option<&str>) {
        self.errors.lock().push((reason, detail.map(str::to_string)));
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Waits until the handler has seen at least `n` events.
pub async fn wait_for_events(handler: &RecordingHandler, n: usize) -> Vec<RecordedEvent> {
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (handler.event_count() >= n).then(|| handler.events())
    })
    .await
}
