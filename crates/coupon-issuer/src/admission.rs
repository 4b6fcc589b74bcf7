//! Admission control: deduplicate, then take a quota slot, then enqueue.
//!
//! [`AdmissionController`] is stateless. All shared mutable state lives in the
//! membership set and the quota counter, and it is only ever touched through
//! their atomic operations, so any number of controllers (and any number of
//! concurrent calls on one controller) may run side by side.
//!
//! ## Ordering
//!
//! 1. `add_if_absent(user)`: a repeat caller is turned away *before* it can
//!    consume a quota slot.
//! 2. `increment_and_get()`: the returned value is this request's slot. Values
//!    above the quota are rejected. The counter may therefore run past the
//!    quota under contention, but at most `quota` callers ever observe a value
//!    inside it, so at most `quota` events are emitted.
//! 3. Publish the [`AdmissionEvent`].
//!
//! ## Failure
//!
//! - Steps 1–2 failing (or the deadline expiring first) yields
//!   [`Error::Unavailable`]. A user already added in step 1 stays a member.
//! - Step 3 failing yields [`Error::FulfillmentUnavailable`]. The slot is
//!   spent and nothing is retried here, since retrying would count twice.

use crate::{
    error::{Error, Result},
    queue::FulfillmentQueue,
    store::{MembershipStore, QuotaCounter},
    types::{AdmissionEvent, Decision, UserId, UserRequest},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

/// Default end-to-end bound on a single apply call.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Upper bound on admitted users (and therefore issued coupons).
    pub quota: u64,
    /// Deadline for one apply call.
    pub timeout: Duration,
}

impl AdmissionConfig {
    pub const fn new(quota: u64) -> Self {
        Self {
            quota,
            timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Decides, for each apply call, whether the user receives a coupon.
pub struct AdmissionController<M, C, Q> {
    membership: Arc<M>,
    counter: Arc<C>,
    queue: Arc<Q>,
    config: AdmissionConfig,
}

impl<M, C, Q> Clone for AdmissionController<M, C, Q> {
    fn clone(&self) -> Self {
        Self {
            membership: Arc::clone(&self.membership),
            counter: Arc::clone(&self.counter),
            queue: Arc::clone(&self.queue),
            config: self.config,
        }
    }
}

impl<M, C, Q> AdmissionController<M, C, Q>
where
    M: MembershipStore,
    C: QuotaCounter,
    Q: FulfillmentQueue,
{
    pub fn new(membership: Arc<M>, counter: Arc<C>, queue: Arc<Q>, config: AdmissionConfig) -> Self {
        Self {
            membership,
            counter,
            queue,
            config,
        }
    }

    pub const fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Runs the admission protocol for `user_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unavailable`] if the membership set or quota counter fails,
    ///   or the deadline passes before the quota check completes.
    /// - [`Error::FulfillmentUnavailable`] if the user was given a slot but the
    ///   event could not be published in time.
    pub async fn apply(&self, user_id: UserId) -> Result<Decision> {
        self.apply_request(UserRequest::new(user_id)).await
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(name = "admission.apply", skip_all, fields(user_id = %request.user_id)))]
    pub async fn apply_request(&self, request: UserRequest) -> Result<Decision> {
        let user_id = request.user_id;
        let deadline = Instant::from_std(request.arrived_at) + self.config.timeout;

        // Step 1: dedup before quota.
        let first_attempt = timeout_at(deadline, self.membership.add_if_absent(user_id))
            .await
            .map_err(|_| Error::unavailable("timed out adding user to membership set"))??;
        if !first_attempt {
            #[cfg(feature = "tracing")]
            tracing::debug!("Rejected duplicate");
            return Ok(Decision::RejectedDuplicate);
        }

        // Step 2: claim a slot. The value is ours alone; no read-back.
        let ordinal = timeout_at(deadline, self.counter.increment_and_get())
            .await
            .map_err(|_| Error::unavailable("timed out incrementing quota counter"))??;
        if ordinal > self.config.quota {
            #[cfg(feature = "tracing")]
            tracing::debug!(ordinal, quota = self.config.quota, "Rejected over quota");
            return Ok(Decision::RejectedQuotaExceeded);
        }

        // Step 3: hand off to fulfillment. Never retried here.
        let event = AdmissionEvent::new(user_id, ordinal);
        let published = match timeout_at(deadline, self.queue.publish(event)).await {
            Ok(res) => res.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "timed out publishing to `{}`",
                self.queue.topic()
            )),
        };
        if let Err(context) = published {
            #[cfg(feature = "tracing")]
            tracing::error!(ordinal, %context, "Admitted user could not be queued for fulfillment");
            return Err(Error::FulfillmentUnavailable {
                user_id,
                ordinal,
                context,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(ordinal, elapsed_us = request.elapsed().as_micros() as u64, "Admitted");
        Ok(Decision::Admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{Delivery, MemoryQueue},
        store::{MemoryMembershipSet, MemoryQuotaCounter},
    };
    use futures::StreamExt;

    type Controller = AdmissionController<MemoryMembershipSet, MemoryQuotaCounter, MemoryQueue>;

    struct Harness {
        membership: Arc<MemoryMembershipSet>,
        counter: Arc<MemoryQuotaCounter>,
        queue: Arc<MemoryQueue>,
        controller: Controller,
    }

    fn harness(quota: u64, capacity: usize) -> Harness {
        let membership = Arc::new(MemoryMembershipSet::new());
        let counter = Arc::new(MemoryQuotaCounter::new());
        let queue = Arc::new(MemoryQueue::new("coupon_create", capacity));
        let controller = AdmissionController::new(
            Arc::clone(&membership),
            Arc::clone(&counter),
            Arc::clone(&queue),
            AdmissionConfig::new(quota).with_timeout(Duration::from_millis(100)),
        );
        Harness {
            membership,
            counter,
            queue,
            controller,
        }
    }

    #[tokio::test]
    async fn second_call_is_duplicate_and_counts_once() {
        let h = harness(100, 16);
        let user = UserId::new(1);

        assert_eq!(h.controller.apply(user).await, Ok(Decision::Admitted));
        assert_eq!(h.controller.apply(user).await, Ok(Decision::RejectedDuplicate));
        assert_eq!(h.counter.current(), 1);
        assert_eq!(h.queue.pending(), 1);
    }

    #[tokio::test]
    async fn over_quota_users_are_rejected_but_still_counted() {
        let h = harness(2, 16);
        for user in 0..2 {
            assert_eq!(
                h.controller.apply(UserId::new(user)).await,
                Ok(Decision::Admitted)
            );
        }
        assert_eq!(
            h.controller.apply(UserId::new(2)).await,
            Ok(Decision::RejectedQuotaExceeded)
        );
        // Overshoot is expected: the counter records the attempt.
        assert_eq!(h.counter.current(), 3);
        assert_eq!(h.queue.pending(), 2);
        // And the rejected user has used up their one attempt.
        assert_eq!(
            h.controller.apply(UserId::new(2)).await,
            Ok(Decision::RejectedDuplicate)
        );
    }

    #[tokio::test]
    async fn events_carry_ordinal_within_quota() {
        let h = harness(3, 16);
        for user in 10..13 {
            h.controller.apply(UserId::new(user)).await.unwrap();
        }
        h.queue.close();

        let mut ordinals = Vec::new();
        let mut sub = h.queue.subscribe();
        while let Some(delivery) = sub.next().await {
            ordinals.push(delivery.event().ordinal);
            delivery.ack();
        }
        ordinals.sort_unstable();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unreachable_membership_is_unavailable_and_spends_nothing() {
        let h = harness(10, 16);
        h.membership.set_reachable(false);

        let res = h.controller.apply(UserId::new(1)).await;
        assert!(matches!(res, Err(Error::Unavailable { .. })));
        assert_eq!(h.counter.current(), 0);
        assert_eq!(h.queue.pending(), 0);
    }

    #[tokio::test]
    async fn unreachable_counter_leaves_user_marked() {
        let h = harness(10, 16);
        h.counter.set_reachable(false);

        let res = h.controller.apply(UserId::new(1)).await;
        assert!(matches!(res, Err(Error::Unavailable { .. })));
        assert!(h.membership.contains(UserId::new(1)));

        // Documented forfeit: the retry is a duplicate.
        h.counter.set_reachable(true);
        assert_eq!(
            h.controller.apply(UserId::new(1)).await,
            Ok(Decision::RejectedDuplicate)
        );
        assert_eq!(h.counter.current(), 0);
    }

    /// Membership set that answers only after `delay`.
    struct SlowMembership {
        inner: MemoryMembershipSet,
        delay: Duration,
    }

    impl MembershipStore for SlowMembership {
        async fn add_if_absent(&self, user_id: UserId) -> Result<bool> {
            tokio::time::sleep(self.delay).await;
            self.inner.add_if_absent(user_id).await
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    /// Quota counter that answers only after `delay`.
    struct SlowCounter {
        inner: MemoryQuotaCounter,
        delay: Duration,
    }

    impl QuotaCounter for SlowCounter {
        async fn increment_and_get(&self) -> Result<u64> {
            tokio::time::sleep(self.delay).await;
            self.inner.increment_and_get().await
        }

        fn current(&self) -> u64 {
            self.inner.current()
        }
    }

    #[tokio::test]
    async fn slow_membership_set_times_out_as_unavailable() {
        let counter = Arc::new(MemoryQuotaCounter::new());
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let controller = AdmissionController::new(
            Arc::new(SlowMembership {
                inner: MemoryMembershipSet::new(),
                delay: Duration::from_secs(5),
            }),
            Arc::clone(&counter),
            Arc::clone(&queue),
            AdmissionConfig::new(10).with_timeout(Duration::from_millis(50)),
        );

        let res = controller.apply(UserId::new(1)).await;
        assert!(matches!(res, Err(Error::Unavailable { .. })));
        assert_eq!(counter.current(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn slow_counter_times_out_and_keeps_membership() {
        let membership = Arc::new(MemoryMembershipSet::new());
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let controller = AdmissionController::new(
            Arc::clone(&membership),
            Arc::new(SlowCounter {
                inner: MemoryQuotaCounter::new(),
                delay: Duration::from_secs(5),
            }),
            Arc::clone(&queue),
            AdmissionConfig::new(10).with_timeout(Duration::from_millis(50)),
        );

        let res = controller.apply(UserId::new(2)).await;
        assert!(matches!(res, Err(Error::Unavailable { .. })));
        assert!(membership.contains(UserId::new(2)));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn closed_queue_surfaces_fulfillment_unavailable() {
        let h = harness(10, 16);
        h.queue.close();

        let err = h.controller.apply(UserId::new(4)).await.unwrap_err();
        assert!(err.consumed_quota());
        assert!(matches!(
            err,
            Error::FulfillmentUnavailable { user_id, ordinal: 1, .. } if user_id == UserId::new(4)
        ));
        assert_eq!(h.counter.current(), 1);
    }

    #[tokio::test]
    async fn full_queue_times_out_as_fulfillment_unavailable() {
        let h = harness(10, 1);
        assert_eq!(
            h.controller.apply(UserId::new(1)).await,
            Ok(Decision::Admitted)
        );

        let err = h.controller.apply(UserId::new(2)).await.unwrap_err();
        assert!(matches!(err, Error::FulfillmentUnavailable { ordinal: 2, .. }));
        assert_eq!(h.counter.current(), 2);
        assert_eq!(h.queue.pending(), 1);
    }

    #[tokio::test]
    async fn zero_quota_rejects_everyone_after_dedup() {
        let h = harness(0, 16);
        for user in 0..5 {
            assert_eq!(
                h.controller.apply(UserId::new(user)).await,
                Ok(Decision::RejectedQuotaExceeded)
            );
        }
        assert_eq!(h.membership.len(), 5);
        assert_eq!(h.queue.pending(), 0);
    }
}
