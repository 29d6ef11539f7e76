//! # Listener
//!
//! The listener wires a [`SubscriptionEngine`], the batcher, and the host's
//! [`TriggerHandler`] into one pipeline:
//!
//! ```text
//! ┌────────┐  StoreMessage  ┌────────┐ EngineMessage ┌─────────┐ PipelineMessage ┌────────────┐
//! │ store  │ ─────────────► │ engine │ ────────────► │ batcher │ ──────────────► │ dispatcher │──► handler
//! └────────┘                └────────┘               └─────────┘   (capacity 1)  └────────────┘
//! ```
//!
//! ## Back-pressure
//!
//! The dispatcher awaits each handler call before taking the next batch, so at
//! most one batch is in flight. While the handler works, the pipeline's small
//! channels fill, the engine stops pulling, and the store's live queue absorbs
//! new events. If that queue overflows the store drops the subscription and
//! the engine restarts itself from its checkpoint.
//!
//! ## Shutdown Order
//!
//! `stop` cancels the batcher and dispatcher first and only then stops the
//! engine, so no batch reaches the handler after the engine is asked to stop.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batcher::{spawn_batcher, PipelineMessage};
use crate::config::ListenerConfig;
use crate::engine::{EngineStats, SubscriptionEngine};
use crate::error::{Error, HandlerError, Result};
use crate::filter::EventFilter;
use crate::store::EventStoreClient;
use crate::types::{Batch, DropReason, Position, SubscriptionState};

// =============================================================================
// Trigger Handler
// =============================================================================

/// Outcome of a handler call.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// The host's executor: receives batches and lifecycle notifications.
///
/// # Example
///
/// ```rust
/// use futures::future::BoxFuture;
/// use spitefeed::listener::{HandlerResult, TriggerHandler};
/// use spitefeed::types::Batch;
///
/// struct Projector;
///
/// impl TriggerHandler for Projector {
///     fn on_batch(&self, batch: Batch) -> BoxFuture<'_, HandlerResult> {
///         Box::pin(async move {
///             for event in &batch {
///                 println!("{} {}", event.stream_id, event.event_type);
///             }
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait TriggerHandler: Send + Sync + 'static {
    /// Processes one batch. The next batch is not delivered until this
    /// future completes.
    fn on_batch(&self, batch: Batch) -> BoxFuture<'_, HandlerResult>;

    /// Called once per catch-up cycle when the subscription goes live.
    fn on_caught_up(&self) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async { Ok(()) })
    }

    /// Called when the subscription fails terminally.
    fn on_error(&self, _reason: DropReason, _detail: Option<&str>) {}
}

// =============================================================================
// Listener
// =============================================================================

struct Pipeline {
    cancel: CancellationToken,
    batcher: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Drives one subscription pipeline for a handler.
///
/// # Example
///
/// ```rust,ignore
/// let store = Arc::new(InMemoryEventStore::default());
/// let mut listener = EventStoreListener::spawn(store, Arc::new(Projector), ListenerConfig::default())?;
/// // ...
/// listener.stop().await;
/// ```
pub struct EventStoreListener<C: EventStoreClient, H: TriggerHandler> {
    client: Arc<C>,
    handler: Arc<H>,
    config: ListenerConfig,
    filter: Option<Arc<dyn EventFilter>>,
    engine: Option<SubscriptionEngine<C>>,
    pipeline: Option<Pipeline>,
}

impl<C: EventStoreClient, H: TriggerHandler> EventStoreListener<C, H> {
    /// Creates a listener. Nothing runs until [`start`](Self::start).
    pub fn new(client: Arc<C>, handler: Arc<H>, config: ListenerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            handler,
            config,
            filter: None,
            engine: None,
            pipeline: None,
        })
    }

    /// Creates and starts a listener.
    pub fn spawn(client: Arc<C>, handler: Arc<H>, config: ListenerConfig) -> Result<Self> {
        let mut listener = Self::new(client, handler, config)?;
        listener.start()?;
        Ok(listener)
    }

    /// Only events accepted by `filter` reach the handler.
    pub fn with_filter(mut self, filter: impl EventFilter) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Wires the pipeline to the handler, then starts the engine.
    pub fn start(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (mut engine, events) =
            SubscriptionEngine::new(Arc::clone(&self.client), self.config.engine_config());

        let cancel = CancellationToken::new();
        let (batches, batcher) = spawn_batcher(
            events,
            self.config.batch_config(),
            self.filter.clone(),
            cancel.clone(),
        );
        let dispatcher = tokio::spawn(run_dispatcher(batches, Arc::clone(&self.handler), cancel.clone()));

        if let Err(e) = engine.start(self.config.last_position, self.config.batch_size) {
            cancel.cancel();
            return Err(e);
        }

        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            from = ?self.config.last_position,
            "listener started"
        );

        self.engine = Some(engine);
        self.pipeline = Some(Pipeline {
            cancel,
            batcher,
            dispatcher,
        });
        Ok(())
    }

    /// Reconnects the engine from its last checkpoint.
    ///
    /// This is how an operator recovers a listener after a terminal failure.
    /// A no-op once stopped.
    pub async fn restart(&mut self) -> Result<()> {
        match self.engine.as_mut() {
            Some(engine) => engine.restart().await,
            None => Err(Error::NotStarted),
        }
    }

    /// Stops delivery, then the engine. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.cancel.cancel();
            let timeout = self.config.stop_timeout;

            for (name, task) in [("batcher", pipeline.batcher), ("dispatcher", pipeline.dispatcher)] {
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(task = name, error = %e, "pipeline task ended abnormally"),
                    Err(_) => warn!(task = name, ?timeout, "pipeline task did not stop within the specified time"),
                }
            }
        }

        if let Some(engine) = self.engine.as_mut() {
            engine.stop().await;
        }
    }

    /// Alias for [`stop`](Self::stop).
    pub async fn cancel(&mut self) {
        self.stop().await;
    }

    /// Engine state; [`SubscriptionState::Idle`] before `start`.
    pub fn state(&self) -> SubscriptionState {
        self.engine
            .as_ref()
            .map(|e| e.state())
            .unwrap_or(SubscriptionState::Idle)
    }

    /// Last checkpoint recorded by the engine.
    pub fn checkpoint(&self) -> Option<Position> {
        match &self.engine {
            Some(engine) => engine.checkpoint(),
            None => self.config.last_position,
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.as_ref().map(|e| e.stats()).unwrap_or_default()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }
}

impl<C: EventStoreClient, H: TriggerHandler> Drop for EventStoreListener<C, H> {
    fn drop(&mut self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.cancel.cancel();
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Hands pipeline output to the handler, one message at a time.
async fn run_dispatcher<H: TriggerHandler>(
    mut batches: mpsc::Receiver<PipelineMessage>,
    handler: Arc<H>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = batches.recv() => message,
        };
        let Some(message) = message else { break };

        match message {
            PipelineMessage::Batch(batch) => {
                let size = batch.len();
                let checkpoint = batch.last_position();
                info!(size, checkpoint = ?checkpoint, "processing batch");
                if let Err(e) = handler.on_batch(batch).await {
                    error!(error = %e, size, "trigger handler failed");
                }
            }
            PipelineMessage::CaughtUp => {
                info!("catch-up complete, calling live processing handler");
                if let Err(e) = handler.on_caught_up().await {
                    error!(error = %e, "live processing handler failed");
                }
            }
            PipelineMessage::Failed(failure) => {
                error!(
                    reason = %failure.reason,
                    detail = ?failure.detail,
                    "subscription failed; restart required"
                );
                handler.on_error(failure.reason, failure.detail.as_deref());
            }
        }
    }
}
