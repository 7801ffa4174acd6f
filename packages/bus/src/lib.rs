//! Mergeflow: Message Bus
//!
//! Hub/agent messaging behind one `Transport` trait: store-backed
//! pub/sub in distributed and degraded modes, file-based delivery in
//! isolated mode. Delivery is at-least-once; handlers de-duplicate by
//! message id. During a mode transition, publishes queue and drain once
//! the new transport is attached.

pub mod bus;
pub mod channels;
pub mod error;
pub mod file_transport;
pub mod redis_transport;
pub mod transport;

pub use bus::{BusConfig, BusEvent, MessageBus};
pub use error::BusError;
pub use file_transport::{FileTransport, FileTransportConfig};
pub use redis_transport::RedisTransport;
pub use transport::Transport;
