//! Store-backed transport.
//!
//! Publishes over the store's pub/sub fan-out; optionally appends each
//! message to a per-channel stream trimmed to an approximate maximum
//! length, so late subscribers can inspect recent traffic.

use async_trait::async_trait;
use tokio::sync::mpsc;

use mergeflow_store::KvClient;
use mergeflow_types::Envelope;

use crate::error::BusError;
use crate::transport::Transport;

/// Pub/sub transport over the coordination store.
#[derive(Clone)]
pub struct RedisTransport {
    kv: KvClient,
    /// Approximate cap for per-channel persistence streams; None turns
    /// persistence off.
    max_stream_len: Option<usize>,
}

impl RedisTransport {
    pub fn new(kv: KvClient) -> Self {
        Self {
            kv,
            max_stream_len: None,
        }
    }

    pub fn with_persistence(mut self, max_stream_len: usize) -> Self {
        self.max_stream_len = Some(max_stream_len);
        self
    }

    fn stream_key(channel: &str) -> String {
        format!("stream:{channel}")
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, channel: &str, message: &Envelope) -> Result<(), BusError> {
        let raw = message
            .encode()
            .map_err(|e| BusError::publish(channel, e))?;
        self.kv
            .publish(channel, &raw)
            .await
            .map_err(|e| BusError::publish(channel, e))?;

        if let Some(max_len) = self.max_stream_len {
            // Persistence is best-effort; losing it never fails delivery.
            if let Err(err) = self
                .kv
                .xadd_trimmed(&Self::stream_key(channel), max_len, &raw)
                .await
            {
                tracing::warn!(channel = %channel, error = %err, "stream append failed");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<(String, Envelope)>, BusError> {
        let (mut raw_rx, _pump) = self
            .kv
            .psubscribe(pattern)
            .await
            .map_err(|e| BusError::subscribe(pattern, e))?;

        let (tx, rx) = mpsc::channel(256);
        let pattern_owned = pattern.to_string();
        tokio::spawn(async move {
            while let Some((channel, raw)) = raw_rx.recv().await {
                match Envelope::decode(&raw) {
                    Ok(envelope) => {
                        if tx.send((channel, envelope)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            pattern = %pattern_owned,
                            channel = %channel,
                            error = %err,
                            "dropping undecodable message"
                        );
                    }
                }
            }
        });
        Ok(rx)
    }
}
