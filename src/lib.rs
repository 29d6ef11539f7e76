//! # SpiteFeed - Catch-Up Subscriptions for Event Stores
//!
//! SpiteFeed consumes an append-only event log the way a trigger runtime
//! needs it:
//!
//! - **Catch-up then live**: replay history from a checkpoint, then switch to
//!   newly appended events without a gap
//! - **Effectively-once delivery**: at-least-once from the store, with
//!   redeliveries absorbed by a bounded dedup window
//! - **Batching**: events reach the handler in batches bounded by count and
//!   by time
//! - **Self-healing**: a consumer that falls behind is reconnected from its
//!   last checkpoint automatically
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Store adapter (EventStoreClient)              │
//! │              subscribe(from) -> push StoreMessage               │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ bounded mpsc
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Subscription Engine                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐ │
//! │  │ system filter│  │ dedup window │  │ checkpoint + caught-up │ │
//! │  │              │  │              │  │ latch + restart policy │ │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               Batcher (size / time windows)                     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Listener dispatcher -> TriggerHandler (host)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Order**: events reach the handler in store order, within and across
//!    batches
//! 2. **No resident duplicates**: an id still in the dedup window is never
//!    delivered twice
//! 3. **One caught-up per cycle**: the live signal fires once per catch-up
//!    cycle, however often the store repeats it
//! 4. **Never empty**: no empty batch is ever delivered
//! 5. **One in flight**: the handler sees at most one batch at a time
//!
//! Checkpoints are held in memory only. A host that needs durable progress
//! persists [`Batch::last_position`](types::Batch::last_position) itself and
//! feeds it back through [`ListenerConfig`](config::ListenerConfig).

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for SpiteFeed operations.
pub mod error;

/// Domain types: positions, events, batches, drop reasons, lifecycle state.
pub mod types;

/// Listener, engine and batcher configuration.
pub mod config;

/// The store capability consumed by the engine.
///
/// Implement [`store::EventStoreClient`] to connect SpiteFeed to a store.
pub mod store;

/// In-memory store implementing the store capability.
pub mod memory;

/// Bounded recency set used to suppress redelivered events.
pub mod dedup;

/// Consumer-side event filters.
pub mod filter;

/// Catch-up subscription engine.
///
/// Owns connect, catch-up, live transition, drop handling and restart for one
/// logical subscription. See [`engine::SubscriptionEngine`].
pub mod engine;

/// Count- and time-bounded batching of engine output.
pub mod batcher;

/// Pipeline orchestration and the handler contract.
///
/// The main entry point is [`EventStoreListener`](listener::EventStoreListener).
pub mod listener;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::ListenerConfig;
pub use engine::{EngineMessage, EngineStats, SubscriptionEngine, SubscriptionFailure};
pub use error::{Error, HandlerError, Result};
pub use listener::{EventStoreListener, HandlerResult, TriggerHandler};
pub use memory::InMemoryEventStore;
pub use store::{CatchUpSettings, EventStoreClient, StoreMessage, StoreSubscription};

pub use types::{
    Batch, DropReason, EventId, Position, RecordedEvent, StopCause, StreamId, SubscriptionState,
};
