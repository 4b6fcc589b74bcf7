use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use coupon_issuer::{AdmissionConfig, FulfillmentConfig};
use std::path::PathBuf;

/// Largest accepted shard count for the membership set.
const MAX_MEMBERSHIP_SHARDS: usize = 1 << 16;

/// Runtime configuration for the `coupon-issuer-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults that match a single campaign of
/// 100 coupons.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "coupon-issuer-server",
    version,
    about = "Issues a bounded number of one-per-user coupons"
)]
pub struct CliArgs {
    /// Upper bound on issued coupons for this campaign.
    ///
    /// Environment variable: `QUOTA`
    #[arg(long, env = "QUOTA", default_value_t = 100)]
    pub quota: u64,

    /// Name of the channel carrying admission events to the workers.
    ///
    /// Environment variable: `QUEUE_TOPIC`
    #[arg(long, env = "QUEUE_TOPIC", default_value_t = String::from("coupon_create"))]
    pub queue_topic: String,

    /// Maximum number of unacknowledged admission events.
    ///
    /// Once reached, admission waits for the workers (back-pressure) until the
    /// apply timeout expires.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Number of fulfillment workers consuming the queue. Defaults to the
    /// number of logical CPUs.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = num_cpus::get())]
    pub num_workers: usize,

    /// End-to-end deadline for a single apply call, in milliseconds.
    ///
    /// Environment variable: `APPLY_TIMEOUT_MS`
    #[arg(long, env = "APPLY_TIMEOUT_MS", default_value_t = 500)]
    pub apply_timeout_ms: u64,

    /// Deliveries of one event before it is dead-lettered. `0`, the default,
    /// retries forever.
    ///
    /// Environment variable: `MAX_DELIVERY_ATTEMPTS`
    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = 0)]
    pub max_delivery_attempts: u32,

    /// Base delay before a failed delivery is retried, in milliseconds.
    ///
    /// Environment variable: `RETRY_BACKOFF_MS`
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 50)]
    pub retry_backoff_ms: u64,

    /// Apply calls allowed in flight at once.
    ///
    /// Environment variable: `CONCURRENCY`
    #[arg(long, env = "CONCURRENCY", default_value_t = 64)]
    pub concurrency: usize,

    /// Lock stripes in the membership set (rounded up to a power of two).
    ///
    /// Environment variable: `MEMBERSHIP_SHARDS`
    #[arg(long, env = "MEMBERSHIP_SHARDS", default_value_t = 64)]
    pub membership_shards: usize,

    /// Path of the durable coupon journal. Without it, coupons are kept in
    /// memory only.
    ///
    /// Environment variable: `COUPON_JOURNAL`
    #[arg(long, env = "COUPON_JOURNAL")]
    pub coupon_journal: Option<PathBuf>,

    /// Generate user ids `0..N` instead of reading them from stdin.
    ///
    /// Environment variable: `SIMULATE_USERS`
    #[arg(long, env = "SIMULATE_USERS")]
    pub simulate_users: Option<u64>,

    /// Seconds to wait for the workers to drain before cancelling them.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,
}

/// Where the campaign's user ids come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSource {
    /// One id per line on stdin.
    Stdin,
    /// Ids `0..users`.
    Simulated { users: u64 },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub admission: AdmissionConfig,
    pub fulfillment: FulfillmentConfig,
    pub queue_topic: String,
    pub queue_capacity: usize,
    pub num_workers: usize,
    pub concurrency: usize,
    pub membership_shards: usize,
    pub journal_path: Option<PathBuf>,
    pub source: UserSource,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }
        if args.concurrency == 0 {
            bail!("CONCURRENCY must be greater than 0");
        }
        if args.apply_timeout_ms == 0 {
            bail!("APPLY_TIMEOUT_MS must be greater than 0");
        }
        if args.queue_topic.trim().is_empty() {
            bail!("QUEUE_TOPIC must not be empty");
        }
        if args.membership_shards == 0 || args.membership_shards > MAX_MEMBERSHIP_SHARDS {
            bail!(
                "MEMBERSHIP_SHARDS ({}) must be between 1 and {}",
                args.membership_shards,
                MAX_MEMBERSHIP_SHARDS
            );
        }

        let source = match args.simulate_users {
            Some(users) => UserSource::Simulated { users },
            None => UserSource::Stdin,
        };

        Ok(Self {
            admission: AdmissionConfig::new(args.quota)
                .with_timeout(Duration::from_millis(args.apply_timeout_ms)),
            fulfillment: FulfillmentConfig {
                max_attempts: args.max_delivery_attempts,
                retry_backoff: Duration::from_millis(args.retry_backoff_ms),
            },
            queue_topic: args.queue_topic,
            queue_capacity: args.queue_capacity,
            num_workers: args.num_workers,
            concurrency: args.concurrency,
            membership_shards: args.membership_shards,
            journal_path: args.coupon_journal,
            source,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["coupon-issuer-server"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_describe_a_hundred_coupon_campaign() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.admission.quota, 100);
        assert_eq!(config.admission.timeout, Duration::from_millis(500));
        assert_eq!(config.queue_topic, "coupon_create");
        assert_eq!(config.fulfillment.max_attempts, 0);
        assert_eq!(config.source, UserSource::Stdin);
        assert!(config.journal_path.is_none());
    }

    #[test]
    fn simulate_users_switches_source() {
        let config = parse(&["--simulate-users", "1000", "--quota", "0"]).unwrap();
        assert_eq!(config.source, UserSource::Simulated { users: 1000 });
        assert_eq!(config.admission.quota, 0);
    }

    #[test]
    fn zero_sized_settings_are_rejected() {
        assert!(parse(&["--num-workers", "0"]).is_err());
        assert!(parse(&["--queue-capacity", "0"]).is_err());
        assert!(parse(&["--concurrency", "0"]).is_err());
        assert!(parse(&["--membership-shards", "0"]).is_err());
        assert!(parse(&["--queue-topic", " "]).is_err());
    }
}
