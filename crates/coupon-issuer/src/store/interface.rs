use crate::{error::Result, types::UserId};
use core::future::Future;

/// A set of user ids with an atomic add-if-absent.
///
/// Implementations must make the check and the insert a single indivisible
/// step observed identically by every caller. Members are never removed
/// during a campaign.
pub trait MembershipStore: Send + Sync {
    /// Adds `user_id`, returning `true` only for the call that inserted it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the backing store cannot be reached.
    ///
    /// [`Error::Unavailable`]: crate::Error::Unavailable
    fn add_if_absent(&self, user_id: UserId) -> impl Future<Output = Result<bool>> + Send;

    /// Number of members. Observation only.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A linearizable counter.
///
/// Every successful `increment_and_get` returns a distinct value, strictly
/// greater than every value returned before it.
pub trait QuotaCounter: Send + Sync {
    /// Increments the counter and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the backing store cannot be reached.
    ///
    /// [`Error::Unavailable`]: crate::Error::Unavailable
    fn increment_and_get(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Current value. Observation only; never use it to decide admission.
    fn current(&self) -> u64;
}

impl<T: MembershipStore> MembershipStore for std::sync::Arc<T> {
    fn add_if_absent(&self, user_id: UserId) -> impl Future<Output = Result<bool>> + Send {
        (**self).add_if_absent(user_id)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

impl<T: QuotaCounter> QuotaCounter for std::sync::Arc<T> {
    fn increment_and_get(&self) -> impl Future<Output = Result<u64>> + Send {
        (**self).increment_and_get()
    }

    fn current(&self) -> u64 {
        (**self).current()
    }
}
