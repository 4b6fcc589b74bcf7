use crate::{
    error::{Error, Result},
    store::{MembershipStore, QuotaCounter},
    types::UserId,
};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::HashSet;

/// Single-lock membership set for tests.
///
/// Can be flipped to unreachable with [`Self::set_reachable`] to exercise the
/// controller's failure paths.
#[derive(Debug, Default)]
pub struct MemoryMembershipSet {
    members: Mutex<HashSet<UserId>>,
    unreachable: AtomicBool,
}

impl MemoryMembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::Release);
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.members.lock().contains(&user_id)
    }
}

impl MembershipStore for MemoryMembershipSet {
    async fn add_if_absent(&self, user_id: UserId) -> Result<bool> {
        if self.unreachable.load(Ordering::Acquire) {
            return Err(Error::unavailable("membership set unreachable"));
        }
        Ok(self.members.lock().insert(user_id))
    }

    fn len(&self) -> usize {
        self.members.lock().len()
    }
}

/// Plain atomic counter for tests, with the same reachability switch as
/// [`MemoryMembershipSet`].
#[derive(Debug, Default)]
pub struct MemoryQuotaCounter {
    value: AtomicU64,
    unreachable: AtomicBool,
}

impl MemoryQuotaCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::Release);
    }
}

impl QuotaCounter for MemoryQuotaCounter {
    async fn increment_and_get(&self) -> Result<u64> {
        if self.unreachable.load(Ordering::Acquire) {
            return Err(Error::unavailable("quota counter unreachable"));
        }
        Ok(self.value.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_if_absent_only_first_call_wins() {
        let set = MemoryMembershipSet::new();
        assert!(set.add_if_absent(UserId::new(1)).await.unwrap());
        assert!(!set.add_if_absent(UserId::new(1)).await.unwrap());
        assert!(set.add_if_absent(UserId::new(2)).await.unwrap());
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_set_fails_without_mutating() {
        let set = MemoryMembershipSet::new();
        set.set_reachable(false);
        assert!(matches!(
            set.add_if_absent(UserId::new(1)).await,
            Err(Error::Unavailable { .. })
        ));
        set.set_reachable(true);
        assert!(!set.contains(UserId::new(1)));
        assert!(set.add_if_absent(UserId::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn counter_returns_post_increment_value() {
        let counter = MemoryQuotaCounter::new();
        assert_eq!(counter.increment_and_get().await.unwrap(), 1);
        assert_eq!(counter.increment_and_get().await.unwrap(), 2);
        assert_eq!(counter.current(), 2);

        counter.set_reachable(false);
        assert!(counter.increment_and_get().await.is_err());
        assert_eq!(counter.current(), 2);
    }
}
