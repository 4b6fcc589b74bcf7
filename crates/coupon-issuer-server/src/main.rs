#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use coupon_issuer::{
    AdmissionController, CouponStore, MemoryQueue, PaddedQuotaCounter, QuotaCounter,
    StripedMembershipSet,
};
use futures::StreamExt;
use server::campaign::{run_campaign, simulated_users, stdin_users};
use server::config::{CliArgs, ServerConfig, UserSource};
use server::pool::manager::FulfillmentPool;
use server::records::RecordStore;
use server::telemetry::init_telemetry;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let res = run(config).await;
    if let Err(e) = &res {
        tracing::error!("Campaign aborted: {e:#}");
    }

    providers.shutdown();
    res
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let membership = Arc::new(StripedMembershipSet::new(config.membership_shards));
    let counter = Arc::new(PaddedQuotaCounter::new());
    let queue = Arc::new(MemoryQueue::new(
        config.queue_topic.clone(),
        config.queue_capacity,
    ));
    let store = Arc::new(RecordStore::open(config.journal_path.as_deref()).await?);

    let pool = FulfillmentPool::spawn(
        config.num_workers,
        Arc::clone(&queue),
        Arc::clone(&store),
        config.fulfillment,
        config.shutdown_timeout,
    );
    let controller = AdmissionController::new(
        membership,
        Arc::clone(&counter),
        Arc::clone(&queue),
        config.admission,
    );

    let users = match config.source {
        UserSource::Stdin => stdin_users().boxed(),
        UserSource::Simulated { users } => simulated_users(users).boxed(),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let report = run_campaign(controller, users, config.concurrency, shutdown).await;
    tracing::info!("Admission finished: {report}");
    if report.fulfillment_unavailable > 0 {
        tracing::error!(
            "{} admitted users were never queued for fulfillment and need reconciliation",
            report.fulfillment_unavailable
        );
    }

    let stats = pool.drain().await;
    let issued = store.count().await?;
    tracing::info!(
        quota = config.admission.quota,
        counter = counter.current(),
        issued,
        store = store.kind(),
        "Fulfillment finished: {stats:?}"
    );

    let pending = queue.pending();
    if pending > 0 {
        tracing::warn!("{pending} admission events were left unsettled");
    }
    for dead in queue.dead_letters() {
        tracing::warn!(
            user_id = %dead.event.user_id,
            ordinal = dead.event.ordinal,
            attempts = dead.attempts,
            "Dead-lettered: {}",
            dead.reason
        );
    }

    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting coupon campaign with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting coupon campaign (quota {}) with {} workers",
            config.admission.quota,
            config.num_workers
        );
    }
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, no longer accepting users");
    shutdown.cancel();
}
