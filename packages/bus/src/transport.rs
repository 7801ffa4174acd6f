//! Transport seam.
//!
//! The bus never knows which wire it is on. Ordering guarantee at this
//! layer: per-publisher-per-channel FIFO; nothing across channels.

use async_trait::async_trait;
use tokio::sync::mpsc;

use mergeflow_types::Envelope;

use crate::error::BusError;

/// One message delivery mechanism.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, channel: &str, message: &Envelope) -> Result<(), BusError>;

    /// Subscribe to every channel matching `pattern`. Messages arrive as
    /// `(channel, envelope)` until the receiver is dropped.
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<(String, Envelope)>, BusError>;
}
