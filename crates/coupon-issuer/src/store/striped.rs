use crate::{
    error::Result,
    store::{MembershipStore, QuotaCounter},
    types::UserId,
};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashSet;

/// Default number of shards for [`StripedMembershipSet`].
pub const DEFAULT_MEMBERSHIP_SHARDS: usize = 64;

/// A lock-striped membership set shared by every controller in the process.
///
/// User ids are spread over a power-of-two number of shards, each guarded by
/// its own [`parking_lot::Mutex`] and padded to a cache line. Two requests only
/// contend when their ids land on the same shard, and add-if-absent for one id
/// is always a single critical section on a single shard.
///
/// ## Recommended When
/// - Many concurrent apply calls within one process
/// - The campaign fits in memory
pub struct StripedMembershipSet {
    shards: Box<[CachePadded<Mutex<HashSet<UserId>>>]>,
    shift: u32,
}

impl StripedMembershipSet {
    /// Creates a set with at least `shards` shards (rounded up to a power of
    /// two, minimum 1).
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        Self {
            shards: (0..shards)
                .map(|_| CachePadded::new(Mutex::new(HashSet::new())))
                .collect(),
            shift: u64::BITS - shards.trailing_zeros(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, user_id: UserId) -> &Mutex<HashSet<UserId>> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        // Fibonacci hashing spreads sequential ids across shards.
        let idx = user_id.get().wrapping_mul(0x9E37_79B9_7F4A_7C15) >> self.shift;
        &self.shards[idx as usize]
    }
}

impl Default for StripedMembershipSet {
    fn default() -> Self {
        Self::new(DEFAULT_MEMBERSHIP_SHARDS)
    }
}

impl MembershipStore for StripedMembershipSet {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    async fn add_if_absent(&self, user_id: UserId) -> Result<bool> {
        Ok(self.shard_for(user_id).lock().insert(user_id))
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// A cache-padded atomic counter shared by every controller in the process.
#[derive(Default)]
pub struct PaddedQuotaCounter {
    value: CachePadded<AtomicU64>,
}

impl PaddedQuotaCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaCounter for PaddedQuotaCounter {
    async fn increment_and_get(&self) -> Result<u64> {
        Ok(self.value.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
