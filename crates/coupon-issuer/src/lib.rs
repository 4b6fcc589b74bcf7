#![doc = include_str!("../README.md")]

mod admission;
mod error;
mod fulfillment;
mod queue;
mod records;
mod store;
mod types;


pub use crate::admission::*;
pub use crate::error::*;
pub use crate::fulfillment::*;
pub use crate::queue::*;
pub use crate::records::*;
pub use crate::store::*;
pub use crate::types::*;
