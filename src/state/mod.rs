//! Persistence for maps, campaigns and tasks.
//!
//! `Store` is the adapter the rest of the crate talks to; `MemoryStore`
//! keeps the tables in process and can snapshot them to a JSON state file.

mod memory;
mod store;

pub use memory::MemoryStore;
pub use store::Store;
