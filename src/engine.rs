//! # Subscription Engine
//!
//! The engine owns the lifecycle of one logical subscription: connect, replay
//! history from a checkpoint, notice the switch to live delivery, survive
//! recoverable drops, and stop cleanly.
//!
//! ## State Machine
//!
//! ```text
//! Idle --start--> Connecting --events--> CatchingUp --live signal--> Live
//!                     ^                                               |
//!                     |            overflow drop / restart()          |
//!                     +------------------ Restarting <----------------+
//!
//! other drop  --> Stopped(Failed)      stop() --> Stopped(Requested)
//! ```
//!
//! ## Event Arrival
//!
//! Each store message is handled by a single worker task, so arrival is
//! serialized. Per event, under the engine's mutex (O(1) hold time):
//!
//! 1. store-internal events are dropped silently
//! 2. ids resident in the [`DedupWindow`] are dropped with a warning
//! 3. otherwise the id enters the window, the checkpoint advances to the
//!    event's position, and the event is forwarded downstream
//!
//! ## The Caught-Up Latch
//!
//! The store's "live processing reached" signal becomes exactly one
//! [`EngineMessage::CaughtUp`] per catch-up cycle. The latch lives in the
//! cycle record, which is replaced at the start of every cycle, so it resets
//! precisely when a new catch-up begins and never in between.
//!
//! ## Recovery Policy
//!
//! | Drop reason | Response |
//! |-------------|----------|
//! | `ProcessingQueueOverflow` | restart from the last checkpoint |
//! | anything else | [`EngineMessage::Failed`], engine stops |
//!
//! The dedup window survives restarts, so events the store replays from the
//! checkpoint are still caught while resident.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dedup::DedupWindow;
use crate::error::{Error, Result};
use crate::store::{EventStoreClient, StoreMessage, StoreSubscription};
use crate::types::{DropReason, EventId, Position, RecordedEvent, StopCause, SubscriptionState};

// =============================================================================
// Configuration
// =============================================================================

/// Capacity of the channel carrying engine output downstream.
///
/// Kept small: when the consumer is busy the engine should stop pulling from
/// the store, so the store's own live queue absorbs the burst.
pub const OUTPUT_CHANNEL_SIZE: usize = 64;

/// Slack on top of the stop timeout when waiting for the worker task itself.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Output
// =============================================================================

/// Terminal failure of a subscription instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFailure {
    pub reason: DropReason,
    pub detail: Option<String>,
}

impl SubscriptionFailure {
    pub fn into_error(self) -> Error {
        Error::SubscriptionDropped {
            reason: self.reason,
            detail: self.detail,
        }
    }
}

/// What the engine emits downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineMessage {
    /// A deduplicated, non-internal event, in store order.
    Event(RecordedEvent),
    /// The current catch-up cycle reached live processing. Once per cycle.
    CaughtUp,
    /// The subscription ended for a non-recoverable reason.
    Failed(SubscriptionFailure),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events_accepted: u64,
    pub duplicates_skipped: u64,
    pub internal_skipped: u64,
    pub restarts: u64,
    pub catch_ups_completed: u64,
}

// =============================================================================
// Engine Context (guarded by the per-subscription mutex)
// =============================================================================

/// One catch-up cycle: from (re)connect until the next restart.
#[derive(Debug)]
struct CatchUpCycle {
    number: u64,
    started: Instant,
    caught_up: bool,
}

impl CatchUpCycle {
    fn first() -> Self {
        Self {
            number: 0,
            started: Instant::now(),
            caught_up: false,
        }
    }

    fn next(&self) -> Self {
        Self {
            number: self.number + 1,
            started: Instant::now(),
            caught_up: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Acceptance {
    /// Carries the checkpoint the event replaced.
    Accepted(Option<Position>),
    Duplicate,
    Internal,
}

#[derive(Debug)]
struct EngineContext {
    state: SubscriptionState,
    checkpoint: Option<Position>,
    live_boundary: Option<Position>,
    dedup: DedupWindow,
    cycle: CatchUpCycle,
    stats: EngineStats,
}

impl EngineContext {
    fn new() -> Self {
        Self {
            state: SubscriptionState::Idle,
            checkpoint: None,
            live_boundary: None,
            dedup: DedupWindow::new(1),
            cycle: CatchUpCycle::first(),
            stats: EngineStats::default(),
        }
    }

    fn begin_cycle(&mut self) -> u64 {
        self.cycle = self.cycle.next();
        self.state = SubscriptionState::Connecting;
        self.live_boundary = None;
        self.cycle.number
    }

    fn accept(&mut self, event: &RecordedEvent) -> Acceptance {
        if event.is_internal() {
            self.stats.internal_skipped += 1;
            return Acceptance::Internal;
        }
        if self.dedup.contains(&event.event_id) {
            self.stats.duplicates_skipped += 1;
            return Acceptance::Duplicate;
        }

        self.dedup.add(event.event_id);
        let previous = self.checkpoint.replace(event.position);
        self.stats.events_accepted += 1;
        if self.state == SubscriptionState::Connecting {
            self.state = SubscriptionState::CatchingUp;
        }
        Acceptance::Accepted(previous)
    }

    /// Undoes [`accept`](Self::accept) for an event that never left the
    /// engine, so the next cycle replays it.
    fn withdraw(&mut self, event_id: &EventId, previous: Option<Position>) {
        self.dedup.remove(event_id);
        self.checkpoint = previous;
        self.stats.events_accepted -= 1;
    }

    /// Trips the latch. Returns the catch-up duration the first time per
    /// cycle, `None` on repeats.
    fn mark_caught_up(&mut self) -> Option<Duration> {
        if self.cycle.caught_up {
            return None;
        }
        self.cycle.caught_up = true;
        self.state = SubscriptionState::Live;
        self.stats.catch_ups_completed += 1;
        Some(self.cycle.started.elapsed())
    }

    fn prepare_restart(&mut self) -> Option<Position> {
        self.state = SubscriptionState::Restarting;
        self.stats.restarts += 1;
        self.checkpoint
    }
}

// =============================================================================
// Subscription Engine (public handle)
// =============================================================================

enum Control {
    Restart(oneshot::Sender<()>),
}

struct Worker {
    control: mpsc::Sender<Control>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives one catch-up subscription against an [`EventStoreClient`].
///
/// # Example
///
/// ```rust,ignore
/// let (mut engine, mut events) = SubscriptionEngine::new(client, EngineConfig::default());
/// engine.start(None, 10)?;
///
/// while let Some(message) = events.recv().await {
///     match message {
///         EngineMessage::Event(event) => handle(event),
///         EngineMessage::CaughtUp => println!("live"),
///         EngineMessage::Failed(failure) => return Err(failure.into_error()),
///     }
/// }
/// ```
///
/// `start`, `restart` and `stop` spawn or join Tokio tasks and must run
/// inside a Tokio runtime.
pub struct SubscriptionEngine<C: EventStoreClient> {
    client: Arc<C>,
    config: EngineConfig,
    context: Arc<Mutex<EngineContext>>,
    output: Option<mpsc::Sender<EngineMessage>>,
    batch_size: usize,
    worker: Option<Worker>,
}

impl<C: EventStoreClient> SubscriptionEngine<C> {
    /// Creates an idle engine and the receiving end of its output.
    pub fn new(client: Arc<C>, config: EngineConfig) -> (Self, mpsc::Receiver<EngineMessage>) {
        let (output, receiver) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        let engine = Self {
            client,
            config,
            context: Arc::new(Mutex::new(EngineContext::new())),
            output: Some(output),
            batch_size: 1,
            worker: None,
        };
        (engine, receiver)
    }

    /// Starts catching up from `from` (exclusive; `None` = start of log).
    ///
    /// `batch_size` sizes the dedup window (`batch_size` plus the configured
    /// margin) and, unless overridden, the store's catch-up read page.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] unless the engine is idle;
    /// [`Error::InvalidConfig`] if `batch_size` is zero.
    pub fn start(&mut self, from: Option<Position>, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be at least 1".to_string()));
        }

        {
            let mut context = self.context.lock();
            if context.state != SubscriptionState::Idle {
                return Err(Error::AlreadyStarted);
            }
            context.dedup = DedupWindow::new(self.config.dedup_capacity(batch_size));
            context.checkpoint = from;
            context.state = SubscriptionState::Connecting;
        }

        self.batch_size = batch_size;
        self.spawn_worker(from)
    }

    /// Tears down the current connection and reconnects from the last
    /// checkpoint.
    ///
    /// A no-op on an engine stopped with [`stop`](Self::stop). On an engine
    /// stopped by a fatal drop this is the operator's recovery path.
    ///
    /// A running worker gets the stop timeout (plus a second of grace) to
    /// release its connection. An event still waiting for downstream room is
    /// withdrawn from the checkpoint and replayed by the new connection. A worker
    /// that does not respond in time is abandoned and replaced.
    pub async fn restart(&mut self) -> Result<()> {
        let state = self.context.lock().state;
        match state {
            SubscriptionState::Idle => Err(Error::NotStarted),
            SubscriptionState::Stopped(StopCause::Requested) => Ok(()),
            SubscriptionState::Stopped(StopCause::Failed(reason)) => {
                // The failed worker has finished (or is handing off its
                // failure notice); let it complete on its own.
                self.worker.take();
                let from = self.context.lock().prepare_restart();
                info!(%reason, checkpoint = ?from, "restarting failed subscription");
                self.spawn_worker(from)
            }
            _ => {
                let control = match &self.worker {
                    Some(worker) => worker.control.clone(),
                    None => return Err(Error::Shutdown("subscription engine")),
                };
                let (ack_tx, ack_rx) = oneshot::channel();
                let request = async {
                    control
                        .send(Control::Restart(ack_tx))
                        .await
                        .map_err(|_| Error::Shutdown("subscription engine"))?;
                    ack_rx
                        .await
                        .map_err(|_| Error::Shutdown("subscription engine"))
                };

                let timeout = self.config.stop_timeout + WORKER_STOP_GRACE;
                match tokio::time::timeout(timeout, request).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(?timeout, "subscription did not restart within the specified time, replacing it");
                        self.replace_worker()
                    }
                }
            }
        }
    }

    /// Abandons the current worker and reconnects from the checkpoint.
    fn replace_worker(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.shutdown.cancel();
            worker.task.abort();
        }
        let from = self.context.lock().prepare_restart();
        self.spawn_worker(from)
    }

    /// Stops the subscription and releases the store connection.
    ///
    /// Bounded by the configured stop timeout; overrunning is logged as a
    /// warning and the worker is abandoned. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let timeout = self.config.stop_timeout;
            info!(?timeout, "stopping subscription");
            worker.shutdown.cancel();

            let mut task = worker.task;
            match tokio::time::timeout(timeout + WORKER_STOP_GRACE, &mut task).await {
                Ok(Ok(())) => info!("subscription stopped"),
                Ok(Err(e)) => warn!(error = %e, "subscription worker ended abnormally"),
                Err(_) => {
                    warn!(?timeout, "the subscription did not stop within the specified time");
                    task.abort();
                }
            }
        }

        self.context.lock().state = SubscriptionState::Stopped(StopCause::Requested);
        self.output = None;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.context.lock().state
    }

    /// Position of the last accepted event (or the start position if none
    /// has been accepted yet).
    pub fn checkpoint(&self) -> Option<Position> {
        self.context.lock().checkpoint
    }

    /// Tail position read when the current cycle started without a
    /// checkpoint. Diagnostic only.
    pub fn live_boundary(&self) -> Option<Position> {
        self.context.lock().live_boundary
    }

    pub fn stats(&self) -> EngineStats {
        self.context.lock().stats
    }

    fn spawn_worker(&mut self, from: Option<Position>) -> Result<()> {
        let output = self
            .output
            .clone()
            .ok_or(Error::Shutdown("subscription engine"))?;

        let (control_tx, control_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let worker = WorkerContext {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            batch_size: self.batch_size,
            context: Arc::clone(&self.context),
            output,
            shutdown: shutdown.clone(),
            control: control_rx,
        };
        let task = tokio::spawn(worker.run(from));

        self.worker = Some(Worker {
            control: control_tx,
            shutdown,
            task,
        });
        Ok(())
    }
}

impl<C: EventStoreClient> Drop for SubscriptionEngine<C> {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.shutdown.cancel();
        }
    }
}

// =============================================================================
// Worker Task
// =============================================================================

enum PumpExit {
    Shutdown,
    Restart(oneshot::Sender<()>),
    Overflow,
    Failed(SubscriptionFailure),
    DownstreamClosed,
}

struct WorkerContext<C: EventStoreClient> {
    client: Arc<C>,
    config: EngineConfig,
    batch_size: usize,
    context: Arc<Mutex<EngineContext>>,
    output: mpsc::Sender<EngineMessage>,
    shutdown: CancellationToken,
    control: mpsc::Receiver<Control>,
}

impl<C: EventStoreClient> WorkerContext<C> {
    async fn run(mut self, mut from: Option<Position>) {
        loop {
            let cycle = self.context.lock().begin_cycle();

            if from.is_none() {
                self.read_live_boundary().await;
            }

            let (sink, source) = mpsc::channel(self.config.max_live_queue_size.max(1));
            let settings = self.config.catch_up_settings(self.batch_size);

            let subscription = match self.client.subscribe_to_all(from, settings, sink).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    self.fail(SubscriptionFailure {
                        reason: DropReason::SubscribingError,
                        detail: Some(e.to_string()),
                    })
                    .await;
                    return;
                }
            };
            info!(cycle, checkpoint = ?from, "catch-up subscription started");

            let exit = self.pump(source).await;
            self.teardown(subscription).await;

            match exit {
                PumpExit::Shutdown => return,
                PumpExit::Restart(ack) => {
                    from = self.context.lock().prepare_restart();
                    info!(checkpoint = ?from, "restarting subscription");
                    let _ = ack.send(());
                }
                PumpExit::Overflow => {
                    from = self.context.lock().prepare_restart();
                    info!(checkpoint = ?from, "restarting subscription after queue overflow");
                }
                PumpExit::Failed(failure) => {
                    self.fail(failure).await;
                    return;
                }
                PumpExit::DownstreamClosed => {
                    info!("downstream closed, ending subscription");
                    self.context.lock().state = SubscriptionState::Stopped(StopCause::Requested);
                    return;
                }
            }
        }
    }

    async fn read_live_boundary(&self) {
        match self.client.read_tail_position().await {
            Ok(tail) => {
                debug!(%tail, "read live boundary");
                self.context.lock().live_boundary = Some(tail);
            }
            Err(e) => warn!(error = %e, "could not read tail position"),
        }
    }

    async fn pump(&mut self, mut source: mpsc::Receiver<StoreMessage>) -> PumpExit {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PumpExit::Shutdown,
                Some(control) = self.control.recv() => match control {
                    Control::Restart(ack) => return PumpExit::Restart(ack),
                },
                message = source.recv() => message,
            };

            match message {
                Some(StoreMessage::Event(event)) => {
                    if self.shutdown.is_cancelled() {
                        return PumpExit::Shutdown;
                    }
                    let acceptance = self.context.lock().accept(&event);
                    match acceptance {
                        Acceptance::Accepted(previous) => {
                            let event_id = event.event_id;
                            match self.forward(EngineMessage::Event(event)).await {
                                None => {}
                                Some(PumpExit::Restart(ack)) => {
                                    self.context.lock().withdraw(&event_id, previous);
                                    return PumpExit::Restart(ack);
                                }
                                Some(exit) => return exit,
                            }
                        }
                        Acceptance::Duplicate => warn!(
                            event_type = %event.event_type,
                            event_id = %event.event_id,
                            stream = %event.stream_id,
                            event_number = event.event_number,
                            "duplicate event, skipping processing"
                        ),
                        Acceptance::Internal => {}
                    }
                }
                Some(StoreMessage::LiveProcessingStarted) => {
                    let caught_up = self.context.lock().mark_caught_up();
                    match caught_up {
                        Some(elapsed) => {
                            info!(elapsed_ms = elapsed.as_millis() as u64, "catch-up complete, processing live events");
                            if let Some(exit) = self.forward(EngineMessage::CaughtUp).await {
                                return exit;
                            }
                        }
                        None => debug!("ignoring repeated live processing signal"),
                    }
                }
                Some(StoreMessage::Dropped { reason, error }) => {
                    warn!(
                        %reason,
                        detail = error.as_deref().unwrap_or_default(),
                        "subscription dropped"
                    );
                    if reason.is_recoverable() {
                        return PumpExit::Overflow;
                    }
                    return PumpExit::Failed(SubscriptionFailure {
                        reason,
                        detail: error,
                    });
                }
                None => {
                    return PumpExit::Failed(SubscriptionFailure {
                        reason: DropReason::ConnectionClosed,
                        detail: Some("store closed the subscription without a drop notice".to_string()),
                    });
                }
            }
        }
    }

    /// Sends downstream, giving up if a stop or restart is requested while
    /// waiting.
    async fn forward(&mut self, message: EngineMessage) -> Option<PumpExit> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Some(PumpExit::Shutdown),
            Some(control) = self.control.recv() => match control {
                Control::Restart(ack) => Some(PumpExit::Restart(ack)),
            },
            sent = self.output.send(message) => match sent {
                Ok(()) => None,
                Err(_) => Some(PumpExit::DownstreamClosed),
            },
        }
    }

    async fn teardown(&self, subscription: Box<dyn StoreSubscription>) {
        let timeout = self.config.stop_timeout;
        match tokio::time::timeout(timeout, subscription.stop()).await {
            Ok(Ok(())) => debug!("store subscription released"),
            Ok(Err(e)) => warn!(error = %e, "store subscription did not stop cleanly"),
            Err(_) => warn!(?timeout, "store subscription did not stop within the specified time"),
        }
    }

    async fn fail(&self, failure: SubscriptionFailure) {
        error!(reason = %failure.reason, detail = ?failure.detail, "subscription failed");
        self.context.lock().state = SubscriptionState::Stopped(StopCause::Failed(failure.reason));
        let _ = self.output.send(EngineMessage::Failed(failure)).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
