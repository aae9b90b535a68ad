//! Capped, append-only store boundary used by the tailing broker.
//!
//! The broker never reads domain records; it only appends command records, tails
//! records newer than a position, and deletes matching records. Everything else about
//! persistence is out of its hands.

pub mod capped;
pub mod in_memory;
pub mod postgres;

pub use capped::{CappedStore, NewRecord, RecordFilter, StoreError, StoredRecord};
pub use in_memory::InMemoryCappedStore;
pub use postgres::PostgresCappedStore;
