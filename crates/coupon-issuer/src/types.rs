//! # Shared Issuance Types
//!
//! Value types passed between the admission controller, the fulfillment
//! queue and the fulfillment worker.
//!
//! ## Overview
//!
//! - [`UserId`] - Opaque identifier of a requesting user
//! - [`UserRequest`] - An in-flight apply call, discarded after the decision
//! - [`Decision`] - The synchronous outcome of an apply call
//! - [`AdmissionEvent`] - Queue payload produced on admission
//! - [`CouponId`] / [`Coupon`] - The durable record created by fulfillment

use core::fmt;
use core::str::FromStr;
use ferroid::id::ULID;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Opaque identifier of a user taking part in an issuance campaign.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for UserId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// A single apply call as seen by the admission controller.
///
/// Never persisted. The arrival instant only feeds latency reporting.
#[derive(Copy, Clone, Debug)]
pub struct UserRequest {
    pub user_id: UserId,
    pub arrived_at: Instant,
}

impl UserRequest {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            arrived_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> core::time::Duration {
        self.arrived_at.elapsed()
    }
}

/// Outcome of [`AdmissionController::apply`].
///
/// Both rejections are normal results, not errors.
///
/// [`AdmissionController::apply`]: crate::AdmissionController::apply
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The user passed deduplication and received a quota slot. An
    /// [`AdmissionEvent`] has been handed to the fulfillment queue.
    Admitted,
    /// The user had already been admitted (or had already consumed their one
    /// attempt) earlier in the campaign.
    RejectedDuplicate,
    /// The user passed deduplication but the quota was already spent.
    RejectedQuotaExceeded,
}

impl Decision {
    pub const fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Stable label used in logs and metric attributes.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::RejectedDuplicate => "rejected_duplicate",
            Self::RejectedQuotaExceeded => "rejected_quota_exceeded",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried from the admission controller to the fulfillment worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdmissionEvent {
    pub user_id: UserId,
    /// Quota counter value handed to this admission, in `1..=quota`. Audit
    /// only; fulfillment does not depend on it.
    pub ordinal: u64,
    pub admitted_at_ms: u64,
}

impl AdmissionEvent {
    pub fn new(user_id: UserId, ordinal: u64) -> Self {
        Self {
            user_id,
            ordinal,
            admitted_at_ms: unix_millis(),
        }
    }
}

/// Unique coupon identifier backed by a 128-bit ULID.
///
/// ULIDs sort by creation time, so coupon ids are also time-ordered.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CouponId(u128);

impl CouponId {
    /// Mints a fresh id from the current wall-clock time.
    pub fn generate() -> Self {
        Self(ULID::now().to_raw())
    }

    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u128 {
        self.0
    }

    /// Milliseconds since the Unix epoch embedded in the upper 48 bits.
    pub const fn timestamp_ms(self) -> u64 {
        (self.0 >> 80) as u64
    }
}

impl fmt::Debug for CouponId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CouponId({self})")
    }
}

impl fmt::Display for CouponId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for CouponId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(Self)
    }
}

impl From<CouponId> for String {
    fn from(id: CouponId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CouponId {
    type Error = core::num::ParseIntError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The durable record of an issued coupon.
///
/// Created once by the fulfillment worker and never mutated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub user_id: UserId,
    pub issued_at_ms: u64,
}

impl Coupon {
    /// Builds the coupon for an admitted user with a freshly minted id.
    pub fn issue(event: &AdmissionEvent) -> Self {
        let id = CouponId::generate();
        Self {
            id,
            user_id: event.user_id,
            issued_at_ms: id.timestamp_ms(),
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
