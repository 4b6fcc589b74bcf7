//! Drives a stream of user ids through the admission controller.
//!
//! Every id becomes one apply call. Calls run as independent tasks, at most
//! `concurrency` at a time, and the campaign stops taking new ids as soon as
//! the shutdown token fires. Calls already in flight are allowed to finish.

use crate::server::telemetry;
use core::fmt;
use coupon_issuer::{
    AdmissionController, Decision, Error, FulfillmentQueue, MembershipStore, QuotaCounter, UserId,
};
use futures::{Stream, StreamExt, future, stream};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;

/// Tally of every apply call made during a campaign.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CampaignReport {
    pub requests: u64,
    pub admitted: u64,
    pub duplicates: u64,
    pub over_quota: u64,
    pub unavailable: u64,
    /// Admitted users whose event never reached the queue. Each one holds a
    /// quota slot without a coupon and needs reconciliation.
    pub fulfillment_unavailable: u64,
    pub invalid_input: u64,
}

impl CampaignReport {
    fn record(&mut self, outcome: &CallOutcome) {
        match outcome {
            CallOutcome::Decided(decision) => {
                self.requests += 1;
                match decision {
                    Decision::Admitted => self.admitted += 1,
                    Decision::RejectedDuplicate => self.duplicates += 1,
                    Decision::RejectedQuotaExceeded => self.over_quota += 1,
                }
            }
            CallOutcome::Failed(e) => {
                self.requests += 1;
                if e.consumed_quota() {
                    self.fulfillment_unavailable += 1;
                } else {
                    self.unavailable += 1;
                }
            }
            CallOutcome::Invalid(_) => self.invalid_input += 1,
        }
    }
}

impl fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} admitted={} duplicate={} over_quota={} unavailable={} fulfillment_unavailable={} invalid_input={}",
            self.requests,
            self.admitted,
            self.duplicates,
            self.over_quota,
            self.unavailable,
            self.fulfillment_unavailable,
            self.invalid_input,
        )
    }
}

enum CallOutcome {
    Decided(Decision),
    Failed(Error),
    Invalid(String),
}

/// Applies every user id from `users` and returns the tally.
pub async fn run_campaign<M, C, Q, S>(
    controller: AdmissionController<M, C, Q>,
    users: S,
    concurrency: usize,
    shutdown: CancellationToken,
) -> CampaignReport
where
    M: MembershipStore + 'static,
    C: QuotaCounter + 'static,
    Q: FulfillmentQueue + 'static,
    S: Stream<Item = Result<UserId, String>>,
{
    users
        .take_until(shutdown.cancelled_owned())
        .map(|item| {
            let controller = controller.clone();
            async move {
                match item {
                    Ok(user_id) => tokio::spawn(apply_one(controller, user_id))
                        .await
                        .unwrap_or_else(|e| {
                            CallOutcome::Failed(Error::Unavailable {
                                context: format!("apply task failed: {e}"),
                            })
                        }),
                    Err(input) => CallOutcome::Invalid(input),
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .fold(CampaignReport::default(), |mut report, outcome| {
            report.record(&outcome);
            future::ready(report)
        })
        .await
}

async fn apply_one<M, C, Q>(controller: AdmissionController<M, C, Q>, user_id: UserId) -> CallOutcome
where
    M: MembershipStore,
    C: QuotaCounter,
    Q: FulfillmentQueue,
{
    telemetry::increment_apply_inflight();
    let start = Instant::now();
    let result = controller.apply(user_id).await;
    telemetry::record_apply_duration(start.elapsed().as_secs_f64() * 1_000.0);
    telemetry::decrement_apply_inflight();

    match result {
        Ok(decision) => {
            telemetry::record_decision(decision);
            CallOutcome::Decided(decision)
        }
        Err(e) => {
            if e.consumed_quota() {
                telemetry::increment_apply_errors("fulfillment_unavailable");
            } else {
                tracing::warn!(%user_id, "Apply failed: {e}");
                telemetry::increment_apply_errors("unavailable");
            }
            CallOutcome::Failed(e)
        }
    }
}

/// User ids `0..users`.
pub fn simulated_users(users: u64) -> impl Stream<Item = Result<UserId, String>> + Send + 'static {
    stream::iter((0..users).map(|raw| Ok(UserId::new(raw))))
}

/// One user id per line of stdin. Blank lines are skipped.
pub fn stdin_users() -> impl Stream<Item = Result<UserId, String>> + Send + 'static {
    parse_lines(LinesStream::new(BufReader::new(tokio::io::stdin()).lines()))
}

/// Parses user ids from lines, ending at the first read error.
fn parse_lines<L>(lines: L) -> impl Stream<Item = Result<UserId, String>>
where
    L: Stream<Item = std::io::Result<String>>,
{
    lines
        .take_while(|line| {
            if let Err(e) = line {
                tracing::error!("Stopped reading user ids: {e}");
            }
            future::ready(line.is_ok())
        })
        .filter_map(|line| future::ready(line.ok().and_then(|line| parse_user(&line))))
}

fn parse_user(line: &str) -> Option<Result<UserId, String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(line.parse().map_err(|e| {
        tracing::warn!("Skipping invalid user id {line:?}: {e}");
        line.to_owned()
    }))
}
