//! # Listener Configuration
//!
//! [`ListenerConfig`] is the single knob set for a subscription pipeline. The
//! engine and batcher receive the slices they need ([`EngineConfig`],
//! [`BatchConfig`]) so neither depends on settings it does not use.
//!
//! Connection strings and credentials are not configured here: the host
//! builds an [`EventStoreClient`](crate::store::EventStoreClient) and passes
//! it in.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::CatchUpSettings;
use crate::types::Position;

// =============================================================================
// Defaults
// =============================================================================

/// Events per batch when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Maximum time a partial batch waits before it is flushed.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 50;

/// Live events the store buffers for a slow consumer before dropping the
/// subscription with a queue overflow.
pub const DEFAULT_MAX_LIVE_QUEUE_SIZE: usize = 100_000;

/// Upper bound on tearing down a store subscription.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;

/// Extra dedup window slots on top of the batch size, so a redelivery burst
/// slightly larger than one batch is still caught.
pub const DEFAULT_DEDUP_MARGIN: usize = 28;

// =============================================================================
// Listener Configuration
// =============================================================================

/// Configuration for an [`EventStoreListener`](crate::listener::EventStoreListener).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use spitefeed::config::ListenerConfig;
/// use spitefeed::types::Position;
///
/// let config = ListenerConfig::default()
///     .with_last_position(Position::new(1024, 1024))
///     .with_batch_size(100)
///     .with_batch_timeout(Duration::from_millis(250));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Checkpoint to resume after. `None` replays from the start of the log.
    pub last_position: Option<Position>,

    /// Maximum events per batch. Must be at least 1.
    pub batch_size: usize,

    /// Maximum time between the first event of a batch and its flush.
    /// Must be at least 1ms.
    pub batch_timeout: Duration,

    /// Store-side live queue bound.
    pub max_live_queue_size: usize,

    /// Page size for catch-up reads. Defaults to `batch_size`.
    pub read_batch_size: Option<usize>,

    /// Ask the store to resolve link events to their targets.
    pub resolve_link_tos: bool,

    /// Upper bound on stopping the store subscription.
    pub stop_timeout: Duration,

    /// Dedup window slots beyond `batch_size`.
    pub dedup_margin: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            last_position: None,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            max_live_queue_size: DEFAULT_MAX_LIVE_QUEUE_SIZE,
            read_batch_size: None,
            resolve_link_tos: true,
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            dedup_margin: DEFAULT_DEDUP_MARGIN,
        }
    }
}

impl ListenerConfig {
    /// Sets the checkpoint to resume after.
    pub fn with_last_position(mut self, position: Position) -> Self {
        self.last_position = Some(position);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    pub fn with_max_live_queue_size(mut self, size: usize) -> Self {
        self.max_live_queue_size = size;
        self
    }

    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = Some(size);
        self
    }

    pub fn with_resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_dedup_margin(mut self, margin: usize) -> Self {
        self.dedup_margin = margin;
        self
    }

    /// Checks every bound, returning the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be at least 1".to_string()));
        }
        if self.batch_timeout < Duration::from_millis(1) {
            return Err(Error::InvalidConfig("batch_timeout must be at least 1ms".to_string()));
        }
        if self.max_live_queue_size == 0 {
            return Err(Error::InvalidConfig(
                "max_live_queue_size must be at least 1".to_string(),
            ));
        }
        if self.read_batch_size == Some(0) {
            return Err(Error::InvalidConfig("read_batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Engine slice of this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_live_queue_size: self.max_live_queue_size,
            read_batch_size: self.read_batch_size,
            resolve_link_tos: self.resolve_link_tos,
            stop_timeout: self.stop_timeout,
            dedup_margin: self.dedup_margin,
        }
    }

    /// Batcher slice of this configuration.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            batch_timeout: self.batch_timeout,
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Settings owned by the [`SubscriptionEngine`](crate::engine::SubscriptionEngine).
///
/// The batch size is not part of this struct: it is supplied to `start`,
/// where it sizes both the dedup window and (by default) catch-up reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_live_queue_size: usize,
    pub read_batch_size: Option<usize>,
    pub resolve_link_tos: bool,
    pub stop_timeout: Duration,
    pub dedup_margin: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        ListenerConfig::default().engine_config()
    }
}

impl EngineConfig {
    /// Store settings for a subscription started with `batch_size`.
    pub fn catch_up_settings(&self, batch_size: usize) -> CatchUpSettings {
        CatchUpSettings {
            max_live_queue_size: self.max_live_queue_size,
            read_batch_size: self.read_batch_size.unwrap_or(batch_size).max(1),
            resolve_link_tos: self.resolve_link_tos,
        }
    }

    /// Dedup window capacity for a subscription started with `batch_size`.
    pub fn dedup_capacity(&self, batch_size: usize) -> usize {
        batch_size.saturating_add(self.dedup_margin).max(1)
    }
}

// =============================================================================
// Batch Configuration
// =============================================================================

/// Size and time thresholds for the batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        ListenerConfig::default().batch_config()
    }
}

// =============================================================================
// Tests
// =============================================================================
