//! Pool of [`FulfillmentWorker`]s sharing one queue and one coupon store.
//!
//! Workers compete for deliveries on the same subscription source, so there is
//! no scheduling here: the pool only spawns them and coordinates shutdown
//! through a shared [`CancellationToken`].

use crate::server::telemetry;
use core::time::Duration;
use coupon_issuer::{
    CouponStore, FulfillmentConfig, FulfillmentQueue, FulfillmentStats, FulfillmentWorker,
    MemoryQueue,
};
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// How long each worker gets to finish its current delivery once cancelled.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct FulfillmentPool {
    queue: Arc<MemoryQueue>,
    workers: Vec<JoinHandle<FulfillmentStats>>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl FulfillmentPool {
    /// Spawns `num_workers` workers consuming `queue` into `store`.
    pub fn spawn<S>(
        num_workers: usize,
        queue: Arc<MemoryQueue>,
        store: Arc<S>,
        config: FulfillmentConfig,
        shutdown_timeout: Duration,
    ) -> Self
    where
        S: CouponStore + 'static,
    {
        let shutdown_token = CancellationToken::new();
        let workers = (0..num_workers)
            .map(|worker_id| {
                let worker = FulfillmentWorker::new(
                    worker_id,
                    Arc::clone(&queue),
                    Arc::clone(&store),
                    config,
                );
                tokio::spawn(worker.run(shutdown_token.child_token()))
            })
            .collect();

        tracing::debug!("Spawned {num_workers} fulfillment workers");

        Self {
            queue,
            workers,
            shutdown_token,
            shutdown_timeout,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Gracefully stops the pool and returns the combined worker statistics.
    ///
    /// - Closes the queue so no further admission events are accepted.
    /// - Waits up to `shutdown_timeout` for outstanding events to settle.
    /// - Cancels the shared token and joins each worker (up to 3 seconds).
    ///
    /// Events still unsettled after the timeout stay in the queue and are
    /// reported by the caller as pending.
    pub async fn drain(self) -> FulfillmentStats {
        // === Phase 0: Stop accepting new events ===
        tracing::info!("Closing queue `{}`", self.queue.topic());
        self.queue.close();

        // === Phase 1: Wait for outstanding events to settle ===
        tracing::info!(
            "Draining outstanding events ({} pending)",
            self.queue.pending()
        );
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.queue.pending() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => tracing::debug!("All outstanding events settled"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} events still pending)",
                self.queue.pending()
            ),
        }

        // === Phase 2: Cancel any remaining work ===
        tracing::debug!("Cancelling workers via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Collect worker statistics ===
        let joins = self.workers.into_iter().enumerate().map(|(i, handle)| async move {
            match timeout(WORKER_JOIN_TIMEOUT, handle).await {
                Ok(Ok(stats)) => {
                    tracing::trace!("Worker {i} stopped: {stats:?}");
                    Some(stats)
                }
                Ok(Err(e)) => {
                    tracing::error!("Worker {i} panicked: {e}");
                    None
                }
                Err(_) => {
                    tracing::warn!("Worker {i} shutdown timed out");
                    None
                }
            }
        });

        let mut total = FulfillmentStats::default();
        for stats in futures::future::join_all(joins).await.into_iter().flatten() {
            total.merge(stats);
        }
        telemetry::record_fulfillment(&total);

        tracing::info!("Fulfillment pool shutdown complete");
        total
    }
}
