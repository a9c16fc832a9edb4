//! Key-value storage for tickets.
//!
//! [`KeyValueStore`] abstracts a distributed cache with TTL and compare-and-set;
//! [`KeyValueTicketBackend`] adapts any such store into a
//! [`TicketBackend`](crate::backend::TicketBackend).

mod backend;
mod memory;
mod store;

pub use backend::KeyValueTicketBackend;
pub use memory::MemoryKeyValueStore;
pub use store::{KeyValue, KeyValueStore};
