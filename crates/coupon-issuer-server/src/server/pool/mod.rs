//! Fulfillment worker pool.

pub mod manager;
