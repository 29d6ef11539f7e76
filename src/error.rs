//! # Error Handling for SpiteFeed
//!
//! This module defines the error types used throughout SpiteFeed. A single
//! error enum ([`Error`]) covers every failure mode of the subscription
//! pipeline, which keeps signatures simple for the host embedding it.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Lifecycle | Started twice, restarted before start | Fix the calling code |
//! | Configuration | Zero batch size | Fix the configuration |
//! | Subscription | Store dropped the subscription | Operator restart |
//! | Store | Adapter could not subscribe or read the tail | Investigate the store |
//!
//! Recoverable drops (processing queue overflow) never surface as an
//! [`Error`]: the engine restarts itself from the last checkpoint.

use thiserror::Error;

use crate::types::DropReason;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteFeed operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// `start` was called on an engine or listener that is already running
    /// (or has run). A subscription instance is started exactly once; use
    /// `restart` to reconnect it.
    #[error("subscription already started")]
    AlreadyStarted,

    /// `restart` was called before `start`.
    #[error("subscription not started")]
    NotStarted,

    /// A component's channel closed underneath the caller.
    #[error("{0} has shut down")]
    Shutdown(&'static str),

    // =========================================================================
    // Configuration Errors
    // =========================================================================

    /// The supplied configuration violates a bound (e.g. `batch_size == 0`).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Subscription Errors (terminal for the subscription instance)
    // =========================================================================

    /// The store dropped the subscription for a reason that is not
    /// recoverable by reconnecting.
    ///
    /// # Recovery
    ///
    /// The engine does not self-heal. An operator or supervising component
    /// must call `restart`, which reconnects from the last checkpoint.
    #[error("subscription dropped because {reason}{}", fmt_detail(.detail))]
    SubscriptionDropped {
        /// Reason code reported by the store.
        reason: DropReason,
        /// Optional error text accompanying the drop.
        detail: Option<String>,
    },

    /// The store adapter failed an operation (subscribe, read tail, stop).
    #[error("store error: {0}")]
    Store(String),
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(detail) if !detail.is_empty() => format!(": {}", detail),
        _ => String::new(),
    }
}

impl Error {
    /// Returns true if this error ends the subscription instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::SubscriptionDropped { .. } | Error::Store(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by a trigger handler.
///
/// Handler failures belong to the host: they are logged and the pipeline keeps
/// running.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Tests
// =============================================================================
