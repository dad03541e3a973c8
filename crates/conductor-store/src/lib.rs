//! # conductor-store
//!
//! The process-wide store and the concrete account type.
//!
//! [`MemoryStore`] is an async key/value map with a synchronous read cache:
//! reads are served from memory, writes land in the cache immediately and
//! are applied to the durable layer by a single writer task in the order
//! they were issued, which preserves per-key ordering. On top of the map it
//! keeps the account registry, the per-account balance trackers and the
//! selected routing table, and implements the store traits every other
//! crate programs against.

mod account;
mod store;

pub use account::{AccountBuilder, ConnectorAccount};
pub use store::{MemoryStore, Store, StoreError};
