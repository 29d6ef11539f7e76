//! # Store Capability
//!
//! The engine does not speak any store's network protocol. It consumes an
//! abstract capability, implemented by the surrounding system:
//!
//! - read the current tail position of the global log
//! - subscribe from a position and receive a push stream of
//!   [`StoreMessage`]s: events, a "live processing reached" signal, and a
//!   terminal drop notification
//!
//! ## Push Delivery as a Channel
//!
//! The adapter writes into a bounded `tokio::sync::mpsc` channel owned by the
//! engine. The engine is the single consumer, so event arrival is serialized
//! without callback chaining, and cancelling a connection is just dropping the
//! receiver and stopping the adapter.
//!
//! ```text
//! ┌──────────────┐  StoreMessage   ┌───────────────────┐
//! │ store adapter│ ──────────────► │ SubscriptionEngine│
//! │ (push side)  │  bounded mpsc   │ (single consumer) │
//! └──────────────┘                 └───────────────────┘
//! ```

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{DropReason, Position, RecordedEvent};

// =============================================================================
// Messages
// =============================================================================

/// One item of a store subscription's push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMessage {
    /// An event, in log order.
    Event(RecordedEvent),

    /// Historical replay finished; subsequent events are live. A well-behaved
    /// store sends this once per subscription, but the engine tolerates repeats.
    LiveProcessingStarted,

    /// The store terminated the subscription. Nothing follows this message.
    Dropped {
        reason: DropReason,
        error: Option<String>,
    },
}

// =============================================================================
// Settings
// =============================================================================

/// Catch-up parameters forwarded to the store when subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpSettings {
    /// Live events buffered for a slow consumer before the store drops the
    /// subscription with [`DropReason::ProcessingQueueOverflow`].
    pub max_live_queue_size: usize,

    /// Page size for historical reads.
    pub read_batch_size: usize,

    /// Resolve link events to the events they point to.
    pub resolve_link_tos: bool,
}

// =============================================================================
// Traits
// =============================================================================

/// A running store subscription.
pub trait StoreSubscription: Send {
    /// Stops delivery and releases the underlying connection.
    ///
    /// The engine bounds this call with its stop timeout; an adapter that
    /// overruns is abandoned and assumed to clean up on its own.
    fn stop(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Capability the engine needs from an event store.
///
/// # Rust Pattern: Boxed Futures in Traits
///
/// Methods return [`BoxFuture`] so the trait stays object safe and adapters
/// can be held as `Arc<dyn EventStoreClient>` as well as generically.
pub trait EventStoreClient: Send + Sync + 'static {
    /// Reads the position of the last event currently in the log.
    fn read_tail_position(&self) -> BoxFuture<'_, Result<Position>>;

    /// Subscribes to the global log.
    ///
    /// Events strictly after `from` are delivered (`None` = from the first
    /// event), followed by [`StoreMessage::LiveProcessingStarted`] and then
    /// live events. Every message is written to `sink`.
    fn subscribe_to_all(
        &self,
        from: Option<Position>,
        settings: CatchUpSettings,
        sink: mpsc::Sender<StoreMessage>,
    ) -> BoxFuture<'_, Result<Box<dyn StoreSubscription>>>;
}

impl<C: EventStoreClient + ?Sized> EventStoreClient for std::sync::Arc<C> {
    fn read_tail_position(&self) -> BoxFuture<'_, Result<Position>> {
        (**self).read_tail_position()
    }

    fn subscribe_to_all(
        &self,
        from: Option<Position>,
        settings: CatchUpSettings,
        sink: mpsc::Sender<StoreMessage>,
    ) -> BoxFuture<'_, Result<Box<dyn StoreSubscription>>> {
        (**self).subscribe_to_all(from, settings, sink)
    }
}
