//! Runtime choice between the in-memory and journaled coupon stores.

use coupon_issuer::{Coupon, CouponStore, JournalCouponStore, MemoryCouponStore, UserId};
use std::path::Path;

/// The coupon store selected by `COUPON_JOURNAL`.
pub enum RecordStore {
    Memory(MemoryCouponStore),
    Journal(JournalCouponStore),
}

impl RecordStore {
    /// Opens the journal at `path`, or falls back to memory when unset.
    pub async fn open(path: Option<&Path>) -> coupon_issuer::Result<Self> {
        match path {
            Some(path) => Ok(Self::Journal(JournalCouponStore::open(path).await?)),
            None => {
                tracing::warn!("COUPON_JOURNAL not set; coupons will not survive a restart");
                Ok(Self::Memory(MemoryCouponStore::new()))
            }
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Journal(_) => "journal",
        }
    }
}

impl CouponStore for RecordStore {
    async fn exists_by_user_id(&self, user_id: UserId) -> coupon_issuer::Result<bool> {
        match self {
            Self::Memory(store) => store.exists_by_user_id(user_id).await,
            Self::Journal(store) => store.exists_by_user_id(user_id).await,
        }
    }

    async fn insert_if_absent(&self, coupon: Coupon) -> coupon_issuer::Result<bool> {
        match self {
            Self::Memory(store) => store.insert_if_absent(coupon).await,
            Self::Journal(store) => store.insert_if_absent(coupon).await,
        }
    }

    async fn get(&self, user_id: UserId) -> coupon_issuer::Result<Option<Coupon>> {
        match self {
            Self::Memory(store) => store.get(user_id).await,
            Self::Journal(store) => store.get(user_id).await,
        }
    }

    async fn count(&self) -> coupon_issuer::Result<usize> {
        match self {
            Self::Memory(store) => store.count().await,
            Self::Journal(store) => store.count().await,
        }
    }
}
