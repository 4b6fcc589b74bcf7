use crate::{
    error::{Error, Result},
    records::CouponStore,
    types::{Coupon, UserId},
};
use parking_lot::RwLock;
use portable_atomic::{AtomicU32, Ordering};
use std::collections::HashMap;

/// In-memory coupon store keyed by user.
///
/// [`Self::fail_next_inserts`] makes the next `n` inserts fail, for exercising
/// the worker's retry path.
#[derive(Debug, Default)]
pub struct MemoryCouponStore {
    coupons: RwLock<HashMap<UserId, Coupon>>,
    failures: AtomicU32,
}

impl MemoryCouponStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_inserts(&self, n: u32) {
        self.failures.store(n, Ordering::Release);
    }

    /// Snapshot of all coupons, ordered by coupon id (issue order).
    pub fn coupons(&self) -> Vec<Coupon> {
        let mut coupons: Vec<_> = self.coupons.read().values().copied().collect();
        coupons.sort_unstable_by_key(|c| c.id);
        coupons
    }
}

impl CouponStore for MemoryCouponStore {
    async fn exists_by_user_id(&self, user_id: UserId) -> Result<bool> {
        Ok(self.coupons.read().contains_key(&user_id))
    }

    async fn insert_if_absent(&self, coupon: Coupon) -> Result<bool> {
        let injected = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::persistence("injected insert failure"));
        }

        let mut coupons = self.coupons.write();
        if coupons.contains_key(&coupon.user_id) {
            return Ok(false);
        }
        coupons.insert(coupon.user_id, coupon);
        Ok(true)
    }

    async fn get(&self, user_id: UserId) -> Result<Option<Coupon>> {
        Ok(self.coupons.read().get(&user_id).copied())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.coupons.read().len())
    }
}
