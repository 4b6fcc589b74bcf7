//! Atomic primitives the admission controller is built on.
//!
//! Two capabilities are required: a set with an indivisible add-if-absent,
//! and a counter with an indivisible increment-and-get. Each has a
//! production backing for sharing across controller instances and a simple
//! backing for tests that can be switched to unreachable.

mod interface;
mod memory;
mod striped;

pub use interface::*;
pub use memory::*;
pub use striped::*;
