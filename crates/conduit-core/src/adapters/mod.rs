//! # Infrastructure Adapters
//!
//! Infrastructure implementations of the storage interfaces.

pub mod memory_event_store;

pub use memory_event_store::InMemoryEventStore;
