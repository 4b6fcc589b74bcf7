//! Fulfillment: turn admission events into coupon records.
//!
//! [`FulfillmentWorker`] consumes a queue subscription and, for each delivery,
//! persists at most one coupon per user before acknowledging. Redelivered
//! copies of an event find the existing record and are acknowledged without
//! writing. The insert itself is conflict-safe, so the check is only a fast
//! path and several workers may share one queue and one store.
//!
//! A failed write is never fatal to the worker: the delivery is nacked after an
//! exponential backoff and retried on redelivery, by default forever. Setting
//! `max_attempts` dead-letters an event after that many deliveries, so a
//! poison event cannot stall the queue.
//!
//! A write that has started always runs to completion, even on shutdown. Only
//! the wait between attempts is cut short.

use crate::{
    error::Result,
    queue::{Delivery, FulfillmentQueue},
    records::CouponStore,
    types::{AdmissionEvent, Coupon},
};
use core::time::Duration;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default delivery count after which an event is dead-lettered. `0` never
/// dead-letters: an admitted user has already spent their slot.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 0;

/// Default base delay before a failed delivery is returned to the queue.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound on the retry delay regardless of attempt count.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FulfillmentConfig {
    /// Deliveries allowed before dead-lettering. `0` retries forever.
    pub max_attempts: u32,
    /// Delay after the first failure, doubled on every further attempt.
    pub retry_backoff: Duration,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl FulfillmentConfig {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF)
    }
}

/// What happened to a single delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new coupon was persisted.
    Fulfilled,
    /// A coupon already existed; the delivery was a redelivery.
    AlreadyFulfilled,
    /// Persistence failed; returned to the queue.
    Retried,
    /// Persistence kept failing; moved to the dead-letter list.
    DeadLettered,
}

/// Counters reported by a worker when it stops.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FulfillmentStats {
    pub fulfilled: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub dead_lettered: u64,
}

impl FulfillmentStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Fulfilled => self.fulfilled += 1,
            Outcome::AlreadyFulfilled => self.duplicates += 1,
            Outcome::Retried => self.retries += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.fulfilled += other.fulfilled;
        self.duplicates += other.duplicates;
        self.retries += other.retries;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Consumes admission events and persists coupons idempotently.
pub struct FulfillmentWorker<Q, S> {
    worker_id: usize,
    queue: Arc<Q>,
    store: Arc<S>,
    config: FulfillmentConfig,
}

impl<Q, S> FulfillmentWorker<Q, S>
where
    Q: FulfillmentQueue,
    S: CouponStore,
{
    pub fn new(worker_id: usize, queue: Arc<Q>, store: Arc<S>, config: FulfillmentConfig) -> Self {
        Self {
            worker_id,
            queue,
            store,
            config,
        }
    }

    /// Runs the consume loop until the subscription ends or `shutdown` fires.
    ///
    /// The delivery in hand when `shutdown` fires is still settled: its write
    /// completes, and a pending retry is nacked without waiting out the
    /// backoff.
    pub async fn run(self, shutdown: CancellationToken) -> FulfillmentStats {
        #[cfg(feature = "tracing")]
        tracing::trace!("Fulfillment worker {} started", self.worker_id);

        let mut stats = FulfillmentStats::default();
        let mut deliveries = self.queue.subscribe();

        loop {
            let delivery = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Fulfillment worker {} received shutdown signal", self.worker_id);
                    break;
                }
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            stats.record(self.handle(delivery, &shutdown).await);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("Fulfillment worker {} stopped: {:?}", self.worker_id, stats);
        stats
    }

    /// Processes one delivery and settles it.
    ///
    /// `shutdown` only shortens the backoff before a nack; the write itself is
    /// never abandoned part-way.
    #[cfg_attr(feature = "tracing", tracing::instrument(
        name = "fulfillment.handle",
        skip_all,
        fields(worker = self.worker_id, user_id = %delivery.event().user_id, attempt = delivery.attempt()),
    ))]
    pub async fn handle(&self, delivery: Q::Delivery, shutdown: &CancellationToken) -> Outcome {
        let event = *delivery.event();

        match self.persist(&event).await {
            Ok(true) => {
                delivery.ack();
                Outcome::Fulfilled
            }
            Ok(false) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Coupon already issued; acknowledging redelivery");
                delivery.ack();
                Outcome::AlreadyFulfilled
            }
            Err(e) => {
                let attempt = delivery.attempt();
                if self.config.max_attempts > 0 && attempt >= self.config.max_attempts {
                    delivery.dead_letter(e.to_string());
                    return Outcome::DeadLettered;
                }

                #[cfg(feature = "tracing")]
                tracing::warn!("Persisting coupon failed, will retry: {e}");
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {}
                    () = tokio::time::sleep(self.config.backoff_for(attempt)) => {}
                }
                delivery.nack();
                Outcome::Retried
            }
        }
    }

    async fn persist(&self, event: &AdmissionEvent) -> Result<bool> {
        if self.store.exists_by_user_id(event.user_id).await? {
            return Ok(false);
        }
        self.store.insert_if_absent(Coupon::issue(event)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{MemoryQueue, RedeliveryPolicy},
        records::MemoryCouponStore,
        types::UserId,
    };

    fn config() -> FulfillmentConfig {
        FulfillmentConfig {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    async fn publish_and_close(queue: &MemoryQueue, users: impl IntoIterator<Item = u64>) {
        for (i, user) in users.into_iter().enumerate() {
            queue
                .publish(AdmissionEvent::new(UserId::new(user), i as u64 + 1))
                .await
                .unwrap();
        }
        queue.close();
    }

    #[tokio::test]
    async fn persists_one_coupon_per_event() {
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let store = Arc::new(MemoryCouponStore::new());
        publish_and_close(&queue, 0..5).await;

        let stats = FulfillmentWorker::new(0, Arc::clone(&queue), Arc::clone(&store), config())
            .run(CancellationToken::new())
            .await;

        assert_eq!(stats.fulfilled, 5);
        assert_eq!(store.count().await.unwrap(), 5);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn redelivered_event_is_a_no_op() {
        let queue = Arc::new(MemoryQueue::with_redelivery(
            "coupon_create",
            16,
            RedeliveryPolicy::Duplicate { copies: 4 },
        ));
        let store = Arc::new(MemoryCouponStore::new());
        publish_and_close(&queue, [42]).await;

        let stats = FulfillmentWorker::new(0, Arc::clone(&queue), Arc::clone(&store), config())
            .run(CancellationToken::new())
            .await;

        assert_eq!(stats.fulfilled, 1);
        assert_eq!(stats.duplicates, 4);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.exists_by_user_id(UserId::new(42)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_write_is_retried_then_succeeds() {
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let store = Arc::new(MemoryCouponStore::new());
        store.fail_next_inserts(2);
        publish_and_close(&queue, [7]).await;

        let stats = FulfillmentWorker::new(0, Arc::clone(&queue), Arc::clone(&store), config())
            .run(CancellationToken::new())
            .await;

        assert_eq!(stats.retries, 2);
        assert_eq!(stats.fulfilled, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn poison_event_is_dead_lettered() {
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let store = Arc::new(MemoryCouponStore::new());
        store.fail_next_inserts(u32::MAX);
        publish_and_close(&queue, [9]).await;

        let stats = FulfillmentWorker::new(0, Arc::clone(&queue), Arc::clone(&store), config())
            .run(CancellationToken::new())
            .await;

        assert_eq!(stats.retries, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(store.count().await.unwrap(), 0);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event.user_id, UserId::new(9));
        assert_eq!(dead[0].attempts, 3);
    }

    #[tokio::test]
    async fn shutdown_leaves_events_for_the_next_consumer() {
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let store = Arc::new(MemoryCouponStore::new());
        queue
            .publish(AdmissionEvent::new(UserId::new(1), 1))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let stats = FulfillmentWorker::new(0, Arc::clone(&queue), Arc::clone(&store), config())
            .run(shutdown)
            .await;
        assert_eq!(stats, FulfillmentStats::default());
        assert_eq!(queue.pending(), 1);

        queue.close();
        let stats = FulfillmentWorker::new(1, Arc::clone(&queue), Arc::clone(&store), config())
            .run(CancellationToken::new())
            .await;
        assert_eq!(stats.fulfilled, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn default_config_outlasts_a_store_outage() {
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let store = Arc::new(MemoryCouponStore::new());
        store.fail_next_inserts(12);
        publish_and_close(&queue, [1]).await;

        let stats = FulfillmentWorker::new(
            0,
            Arc::clone(&queue),
            Arc::clone(&store),
            FulfillmentConfig::default(),
        )
        .run(CancellationToken::new())
        .await;

        assert_eq!(stats.retries, 12);
        assert_eq!(stats.fulfilled, 1);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(queue.dead_letters().is_empty());
    }

    /// Delays every insert so shutdown can land in the middle of one.
    struct SlowStore {
        inner: MemoryCouponStore,
        delay: Duration,
    }

    impl CouponStore for SlowStore {
        async fn exists_by_user_id(&self, user_id: UserId) -> Result<bool> {
            self.inner.exists_by_user_id(user_id).await
        }

        async fn insert_if_absent(&self, coupon: Coupon) -> Result<bool> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert_if_absent(coupon).await
        }

        async fn get(&self, user_id: UserId) -> Result<Option<Coupon>> {
            self.inner.get(user_id).await
        }

        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_an_in_flight_write_finish() {
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let store = Arc::new(SlowStore {
            inner: MemoryCouponStore::new(),
            delay: Duration::from_millis(100),
        });
        queue
            .publish(AdmissionEvent::new(UserId::new(5), 1))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(
            FulfillmentWorker::new(0, Arc::clone(&queue), Arc::clone(&store), config())
                .run(shutdown.clone()),
        );

        // Land inside the insert.
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let stats = worker.await.unwrap();
        assert_eq!(stats.fulfilled, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.acknowledged(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_the_retry_backoff_short() {
        let queue = Arc::new(MemoryQueue::new("coupon_create", 16));
        let store = Arc::new(MemoryCouponStore::new());
        store.fail_next_inserts(u32::MAX);
        queue
            .publish(AdmissionEvent::new(UserId::new(6), 1))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(
            FulfillmentWorker::new(
                0,
                Arc::clone(&queue),
                Arc::clone(&store),
                FulfillmentConfig {
                    max_attempts: 0,
                    retry_backoff: Duration::from_secs(60),
                },
            )
            .run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled_at = tokio::time::Instant::now();
        shutdown.cancel();

        let stats = worker.await.unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.retries, 1);
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn backoff_grows_with_attempts_and_is_capped() {
        let config = FulfillmentConfig {
            max_attempts: 0,
            retry_backoff: Duration::from_millis(100),
        };
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(7), MAX_RETRY_BACKOFF);
        assert_eq!(config.backoff_for(1_000), MAX_RETRY_BACKOFF);
    }
}
