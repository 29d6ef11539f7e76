//! # Event Filters
//!
//! A filter narrows the engine's output before it is batched. The engine
//! already removes store-internal events; filters are for the consumer's own
//! selection (one stream, a family of streams, particular event types).
//!
//! Any `Fn(&RecordedEvent) -> bool` is a filter:
//!
//! ```rust
//! use spitefeed::filter::EventFilter;
//! use spitefeed::types::{Position, RecordedEvent};
//!
//! let large = |e: &RecordedEvent| e.data.len() > 1024;
//! let event = RecordedEvent::new("s", 0, "T", vec![0; 2048], Position::new(1, 1));
//! assert!(large.accepts(&event));
//! ```

use crate::types::{RecordedEvent, StreamId};

/// Decides whether an event is handed to the trigger handler.
pub trait EventFilter: Send + Sync + 'static {
    fn accepts(&self, event: &RecordedEvent) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&RecordedEvent) -> bool + Send + Sync + 'static,
{
    fn accepts(&self, event: &RecordedEvent) -> bool {
        self(event)
    }
}

/// Accepts events from exactly one stream.
#[derive(Debug, Clone)]
pub struct StreamFilter {
    stream_id: StreamId,
}

impl StreamFilter {
    pub fn new(stream_id: impl Into<StreamId>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl EventFilter for StreamFilter {
    fn accepts(&self, event: &RecordedEvent) -> bool {
        event.stream_id == self.stream_id
    }
}

/// Accepts events whose stream name starts with a prefix, e.g. `"order-"`.
#[derive(Debug, Clone)]
pub struct StreamPrefixFilter {
    prefix: String,
}

impl StreamPrefixFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl EventFilter for StreamPrefixFilter {
    fn accepts(&self, event: &RecordedEvent) -> bool {
        event.stream_id.as_str().starts_with(&self.prefix)
    }
}

/// Accepts events whose type is one of a fixed set.
#[derive(Debug, Clone)]
pub struct EventTypeFilter {
    types: Vec<String>,
}

impl EventTypeFilter {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventFilter for EventTypeFilter {
    fn accepts(&self, event: &RecordedEvent) -> bool {
        self.types.iter().any(|t| *t == event.event_type)
    }
}
