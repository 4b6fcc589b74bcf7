//! Error types for coupon issuance.
//!
//! This module defines the central `Error` enum. Rejections (duplicate user,
//! quota spent) are *not* errors: they are returned as a [`Decision`]. The
//! variants here are operational failures that the caller decides whether to
//! retry at the edge.
//!
//! ## Error Cases
//! - `Unavailable`: A membership or counter store could not be reached, or the
//!   admission deadline expired before the quota check finished.
//! - `FulfillmentUnavailable`: The quota slot was taken but the admission
//!   event could not be published. Never retried internally.
//! - `QueueClosed`: The fulfillment queue no longer accepts events.
//! - `Persistence`: The coupon record store rejected a write.
//! - `Journal`: Reading or writing the on-disk coupon journal failed.
//!
//! [`Decision`]: crate::Decision

use crate::types::UserId;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for admission and fulfillment.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// An atomic store is unreachable or did not answer in time.
    #[error("Store unavailable: {context}")]
    Unavailable { context: String },

    /// The quota counter was incremented but the event never reached the
    /// queue. Needs reconciliation outside this crate.
    #[error("Fulfillment unavailable for user {user_id} (ordinal {ordinal}): {context}")]
    FulfillmentUnavailable {
        user_id: UserId,
        ordinal: u64,
        context: String,
    },

    /// The queue was closed before the operation could complete.
    #[error("Queue `{topic}` is closed")]
    QueueClosed { topic: String },

    /// The coupon record store failed to persist or look up a record.
    #[error("Persistence error: {context}")]
    Persistence { context: String },

    /// I/O or decode failure on the coupon journal.
    #[error("Journal error: {0}")]
    Journal(String),
}

impl Error {
    pub(crate) fn unavailable(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
        }
    }

    pub(crate) fn persistence(context: impl Into<String>) -> Self {
        Self::Persistence {
            context: context.into(),
        }
    }

    /// Whether the failure happened after a quota slot was consumed.
    pub const fn consumed_quota(&self) -> bool {
        matches!(self, Self::FulfillmentUnavailable { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Journal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Journal(format!("malformed record: {err}"))
    }
}
