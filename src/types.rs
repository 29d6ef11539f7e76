//! # Domain Types for SpiteFeed
//!
//! This module defines the values that flow through the subscription
//! pipeline: positions in the global log, recorded events, batches, drop
//! reasons, and the subscription lifecycle state.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Identifiers are wrapped in single-field structs so an [`EventId`] can never
//! be passed where a [`StreamId`] is expected, and the representation can
//! change without touching callers.
//!
//! ## Invariants
//!
//! - [`Position`]: totally ordered; `None` (as `Option<Position>`) means
//!   "start of stream"
//! - [`RecordedEvent`]: immutable once received from the store
//! - [`Batch`]: never empty when handed downstream

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

// =============================================================================
// Reserved Names
// =============================================================================

/// Stream names starting with this prefix belong to the store itself
/// (`$stats-*`, `$projections-*`, `$et-*` ...). They are never forwarded.
pub const SYSTEM_STREAM_PREFIX: &str = "$";

/// Event type the store writes when a stream is deleted.
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

// =============================================================================
// Position
// =============================================================================

/// A location in the global event log.
///
/// The store addresses its global log with a (commit, prepare) pair. Ordering
/// compares the commit position first, then the prepare position, which gives
/// a total order matching log order.
///
/// # Rust Pattern: Derived Ordering
///
/// Field order matters for `#[derive(PartialOrd, Ord)]`: comparison is
/// lexicographic in declaration order, so `commit` must come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    commit: u64,
    prepare: u64,
}

impl Position {
    /// The position before the first event of the log.
    pub const START: Position = Position { commit: 0, prepare: 0 };

    /// Creates a position from its commit and prepare components.
    pub const fn new(commit: u64, prepare: u64) -> Self {
        Self { commit, prepare }
    }

    /// Returns the commit component.
    pub fn commit_position(&self) -> u64 {
        self.commit
    }

    /// Returns the prepare component.
    pub fn prepare_position(&self) -> u64 {
        self.prepare
    }

    /// Returns true if `self` comes strictly after `other` in the log.
    pub fn is_after(&self, other: &Position) -> bool {
        self > other
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit, self.prepare)
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier the producer assigned to an event.
///
/// Redelivered events carry the same id, which is what the dedup window keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Name of the stream an event was written to, e.g. `"order-42"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a new stream ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this stream ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for streams owned by the store itself.
    pub fn is_system(&self) -> bool {
        self.0.starts_with(SYSTEM_STREAM_PREFIX)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Recorded Event
// =============================================================================

/// An event as delivered by the store.
///
/// Payload and metadata are held behind `Arc` so the event is cheap to clone
/// while it moves between the engine, the batcher, and the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Producer-assigned unique id.
    pub event_id: EventId,

    /// Stream the event belongs to.
    pub stream_id: StreamId,

    /// Revision of the event within its stream.
    pub event_number: u64,

    /// Event type tag (e.g. `"OrderPlaced"`).
    pub event_type: String,

    /// Event payload.
    pub data: Arc<Vec<u8>>,

    /// Event metadata.
    pub metadata: Arc<Vec<u8>>,

    /// Position of the event in the global log.
    pub position: Position,
}

impl RecordedEvent {
    /// Creates an event with a fresh id and empty metadata.
    pub fn new(
        stream_id: impl Into<StreamId>,
        event_number: u64,
        event_type: impl Into<String>,
        data: Vec<u8>,
        position: Position,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            stream_id: stream_id.into(),
            event_number,
            event_type: event_type.into(),
            data: Arc::new(data),
            metadata: Arc::new(Vec::new()),
            position,
        }
    }

    /// Replaces the event id.
    pub fn with_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    /// Returns true for store-internal events: anything on a system stream,
    /// and stream-deletion markers.
    pub fn is_internal(&self) -> bool {
        self.stream_id.is_system() || self.event_type == STREAM_DELETED_EVENT_TYPE
    }
}

// =============================================================================
// Batch
// =============================================================================

/// An ordered, non-empty group of events handed to the trigger handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    events: Vec<RecordedEvent>,
}

impl Batch {
    /// Wraps a vector of events. Returns `None` for an empty vector; empty
    /// batches are never delivered.
    pub fn new(events: Vec<RecordedEvent>) -> Option<Self> {
        if events.is_empty() {
            None
        } else {
            Some(Self { events })
        }
    }

    /// Number of events in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in arrival order.
    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    /// Iterates over the events in arrival order.
    pub fn iter(&self) -> std::slice::Iter<'_, RecordedEvent> {
        self.events.iter()
    }

    /// Position of the last event, i.e. the checkpoint reached once this
    /// batch is processed.
    pub fn last_position(&self) -> Option<Position> {
        self.events.last().map(|e| e.position)
    }

    /// Consumes the batch, returning its events.
    pub fn into_events(self) -> Vec<RecordedEvent> {
        self.events
    }
}

impl IntoIterator for Batch {
    type Item = RecordedEvent;
    type IntoIter = std::vec::IntoIter<RecordedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a RecordedEvent;
    type IntoIter = std::slice::Iter<'a, RecordedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

// =============================================================================
// Drop Reasons
// =============================================================================

/// Why the store terminated a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The client asked the subscription to stop.
    UserInitiated,
    /// Credentials were rejected.
    NotAuthenticated,
    /// The user may not read the requested stream.
    AccessDenied,
    /// The subscribe request itself failed.
    SubscribingError,
    /// The server reported an error.
    ServerError,
    /// The underlying connection closed.
    ConnectionClosed,
    /// Reading historical events failed.
    CatchUpError,
    /// The consumer did not keep up and the live queue filled.
    ProcessingQueueOverflow,
    /// The event callback raised an error.
    EventHandlerException,
    /// The server refused another subscriber.
    MaxSubscribersReached,
    /// Any reason the adapter cannot map.
    Unknown,
}

impl DropReason {
    /// Returns true if the engine should reconnect on its own.
    ///
    /// Only a processing queue overflow qualifies: the consumer was slow, and
    /// resuming from the last checkpoint loses nothing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DropReason::ProcessingQueueOverflow)
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::UserInitiated => "user initiated",
            DropReason::NotAuthenticated => "not authenticated",
            DropReason::AccessDenied => "access denied",
            DropReason::SubscribingError => "subscribing error",
            DropReason::ServerError => "server error",
            DropReason::ConnectionClosed => "connection closed",
            DropReason::CatchUpError => "catch-up error",
            DropReason::ProcessingQueueOverflow => "processing queue overflow",
            DropReason::EventHandlerException => "event handler exception",
            DropReason::MaxSubscribersReached => "max subscribers reached",
            DropReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Subscription State
// =============================================================================

/// Why a subscription reached [`SubscriptionState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// `stop()` was called.
    Requested,
    /// A non-recoverable drop ended the subscription.
    Failed(DropReason),
}

/// Lifecycle state of a subscription engine.
///
/// ```text
/// Idle --start--> Connecting --events--> CatchingUp --live--> Live
///                     ^                                        |
///                     +------ Restarting <--- overflow drop ---+
///
/// any --stop()--> Stopped(Requested)     any --other drop--> Stopped(Failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created, never started.
    Idle,
    /// Opening the store subscription.
    Connecting,
    /// Replaying historical events.
    CatchingUp,
    /// Receiving newly appended events.
    Live,
    /// Tearing down the old connection before reconnecting.
    Restarting,
    /// No longer delivering events.
    Stopped(StopCause),
}

impl SubscriptionState {
    /// Returns true while the engine owns a live connection attempt.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Connecting
                | SubscriptionState::CatchingUp
                | SubscriptionState::Live
                | SubscriptionState::Restarting
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
