//! Mergeflow: State Store
//!
//! Client for the shared coordination store (Redis) plus a typed facade
//! over the coordination keyspace. The hub owns every key written here;
//! agents reach the same data only through the bus.

pub mod client;
pub mod error;
pub mod keys;
pub mod state;

pub use client::{KvClient, KvClientConfig};
pub use error::StoreError;
pub use state::{StateStore, StateStoreConfig};
