//! Durable coupon records.
//!
//! The fulfillment worker is the only writer. Inserts are conflict-safe on
//! `user_id`, so concurrent workers handling redelivered copies of one event
//! still persist a single coupon.

mod interface;
mod journal;
mod memory;

pub use interface::*;
pub use journal::*;
pub use memory::*;
