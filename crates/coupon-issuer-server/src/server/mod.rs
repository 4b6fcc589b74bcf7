//! Components of the `coupon-issuer-server` campaign runner.
//!
//! ## Submodules
//!
//! - [`config`] - CLI and environment configuration.
//! - [`campaign`] - Feeds user ids through admission with bounded concurrency.
//! - [`pool`] - Fulfillment workers and their graceful shutdown.
//! - [`records`] - Selects the in-memory or journaled coupon store.
//! - [`telemetry`] - Console logging and optional OpenTelemetry export.

pub mod campaign;
pub mod config;
pub mod pool;
pub mod records;
pub mod telemetry;
