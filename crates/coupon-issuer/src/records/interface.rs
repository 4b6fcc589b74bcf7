use crate::{
    error::Result,
    types::{Coupon, UserId},
};
use core::future::Future;

/// System of record for issued coupons.
pub trait CouponStore: Send + Sync {
    /// Whether a coupon already exists for `user_id`.
    fn exists_by_user_id(&self, user_id: UserId) -> impl Future<Output = Result<bool>> + Send;

    /// Persists `coupon` unless one already exists for its user.
    ///
    /// Returns `true` if this call created the record. The uniqueness check and
    /// the write happen atomically with respect to other inserts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] or [`Error::Journal`] if the write
    /// could not be made durable. Nothing is recorded in that case.
    ///
    /// [`Error::Persistence`]: crate::Error::Persistence
    /// [`Error::Journal`]: crate::Error::Journal
    fn insert_if_absent(&self, coupon: Coupon) -> impl Future<Output = Result<bool>> + Send;

    fn get(&self, user_id: UserId) -> impl Future<Output = Result<Option<Coupon>>> + Send;

    fn count(&self) -> impl Future<Output = Result<usize>> + Send;
}

impl<T: CouponStore> CouponStore for std::sync::Arc<T> {
    fn exists_by_user_id(&self, user_id: UserId) -> impl Future<Output = Result<bool>> + Send {
        (**self).exists_by_user_id(user_id)
    }

    fn insert_if_absent(&self, coupon: Coupon) -> impl Future<Output = Result<bool>> + Send {
        (**self).insert_if_absent(coupon)
    }

    fn get(&self, user_id: UserId) -> impl Future<Output = Result<Option<Coupon>>> + Send {
        (**self).get(user_id)
    }

    fn count(&self) -> impl Future<Output = Result<usize>> + Send {
        (**self).count()
    }
}
