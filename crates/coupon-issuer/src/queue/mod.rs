//! Fulfillment queue: at-least-once delivery of admission events.
//!
//! The controller only publishes; the worker only subscribes. Delivery order
//! is not part of the contract. Every published event is delivered until a
//! consumer acknowledges it or routes it to the dead-letter list.

mod interface;
mod memory;

pub use interface::*;
pub use memory::*;
