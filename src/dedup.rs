//! # Dedup Window
//!
//! Stores redeliver events: a reconnect from a checkpoint, or a catch-up read
//! overlapping the live tail, can hand the same event to the consumer twice.
//! The [`DedupWindow`] remembers the ids of the most recent events and rejects
//! any that reappear while still resident.
//!
//! ## Bounded Recency
//!
//! ```text
//!  capacity = 4
//!
//!  add(e5):  [e1 e2 e3 e4]  ->  [e2 e3 e4 e5]     (e1 evicted, FIFO)
//!  contains(e1) == false    // evicted ids are no longer caught
//! ```
//!
//! Membership is exact for resident ids. The window is an [`LruCache`] used
//! in insertion order: `contains` never touches recency and resident ids are
//! never re-inserted, so the least recently used entry is always the oldest
//! insertion and eviction is FIFO.
//!
//! The window is not internally synchronized. The engine owns it inside its
//! per-subscription mutex, which is the only place it is touched.

use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::EventId;

/// Bounded FIFO set of recently seen event ids.
pub struct DedupWindow {
    ids: LruCache<EventId, ()>,
}

impl DedupWindow {
    /// Creates an empty window. A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: LruCache::new(capacity),
        }
    }

    /// Inserts `id`, evicting the oldest entry when the window is full.
    ///
    /// Re-adding a resident id moves nothing; the window only grows with
    /// distinct ids.
    pub fn add(&mut self, id: EventId) {
        if self.ids.contains(&id) {
            return;
        }
        self.ids.push(id, ());
    }

    /// Forgets `id` if it is resident.
    pub fn remove(&mut self, id: &EventId) {
        self.ids.pop(id);
    }

    /// Returns true if `id` is currently resident.
    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    /// Empties the window.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ids.cap().get()
    }
}

impl fmt::Debug for DedupWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupWindow")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
