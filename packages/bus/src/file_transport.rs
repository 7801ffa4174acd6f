//! File-based transport for isolated mode.
//!
//! One message per file: `{base_dir}/{sanitized_channel}/{ts}-{id}.json`,
//! written atomically (temp + rename) and discovered by subscriber
//! polling. Files older than `message_max_age` are swept during polls.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;

use mergeflow_types::Envelope;

use crate::channels::{matches_pattern, sanitize_channel};
use crate::error::BusError;
use crate::transport::Transport;

/// File transport tuning.
#[derive(Debug, Clone)]
pub struct FileTransportConfig {
    pub base_dir: PathBuf,
    pub poll_interval: Duration,
    pub message_max_age: Duration,
}

impl FileTransportConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            poll_interval: Duration::from_millis(250),
            message_max_age: Duration::from_secs(300),
        }
    }
}

/// Spool-directory message transport.
#[derive(Clone)]
pub struct FileTransport {
    config: FileTransportConfig,
}

impl FileTransport {
    pub fn new(config: FileTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for FileTransport {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn publish(&self, channel: &str, message: &Envelope) -> Result<(), BusError> {
        let dir = self.config.base_dir.join(sanitize_channel(channel));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BusError::publish(channel, e))?;

        let raw = message
            .encode()
            .map_err(|e| BusError::publish(channel, e))?;
        let name = format!("{}-{}.json", message.timestamp.timestamp_millis(), message.id);
        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        let dest = dir.join(name);

        tokio::fs::write(&tmp, raw.as_bytes())
            .await
            .map_err(|e| BusError::publish(channel, e))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| BusError::publish(channel, e))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<(String, Envelope)>, BusError> {
        let (tx, rx) = mpsc::channel(256);
        let config = self.config.clone();
        let pattern = sanitize_channel(pattern);

        tokio::spawn(async move {
            let mut seen: HashSet<PathBuf> = HashSet::new();
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match poll_once(&config, &pattern, &mut seen).await {
                    Ok(batch) => {
                        for (channel, envelope) in batch {
                            if tx.send((channel, envelope)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "file transport poll failed");
                    }
                }
            }
        });
        Ok(rx)
    }
}

async fn poll_once(
    config: &FileTransportConfig,
    pattern: &str,
    seen: &mut HashSet<PathBuf>,
) -> std::io::Result<Vec<(String, Envelope)>> {
    let mut batch: Vec<(String, PathBuf)> = Vec::new();
    let now = SystemTime::now();

    let mut dirs = match tokio::fs::read_dir(&config.base_dir).await {
        Ok(dirs) => dirs,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    while let Some(dir_entry) = dirs.next_entry().await? {
        if !dir_entry.file_type().await?.is_dir() {
            continue;
        }
        let channel = dir_entry.file_name().to_string_lossy().to_string();
        let matched = matches_pattern(&channel, pattern);

        let mut files = tokio::fs::read_dir(dir_entry.path()).await?;
        while let Some(file_entry) = files.next_entry().await? {
            let path = file_entry.path();
            let name = file_entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".tmp-") || !name.ends_with(".json") {
                continue;
            }

            // Sweep anything past its retention window.
            if let Ok(meta) = file_entry.metadata().await {
                if let Ok(modified) = meta.modified() {
                    if now
                        .duration_since(modified)
                        .map(|age| age > config.message_max_age)
                        .unwrap_or(false)
                    {
                        let _ = tokio::fs::remove_file(&path).await;
                        seen.remove(&path);
                        continue;
                    }
                }
            }

            if matched && !seen.contains(&path) {
                seen.insert(path.clone());
                batch.push((channel.clone(), path));
            }
        }
    }

    // Filename timestamps give per-channel FIFO.
    batch.sort_by(|a, b| a.1.cmp(&b.1));

    let mut decoded = Vec::with_capacity(batch.len());
    for (channel, path) in batch {
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match Envelope::decode(&raw) {
                Ok(envelope) => decoded.push((channel, envelope)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "dropping undecodable message file");
                }
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed reading message file");
            }
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mergeflow_types::Payload;

    fn envelope(from: &str, reason: &str) -> Envelope {
        Envelope::new(
            from,
            Payload::Shutdown {
                reason: reason.to_string(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_publish_then_poll_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FileTransportConfig::new(dir.path());
        config.poll_interval = Duration::from_millis(20);
        let transport = FileTransport::new(config);

        let mut rx = transport.subscribe("agent-*").await.unwrap();

        let sent = envelope("hub", "one");
        transport.publish("agent-w1", &sent).await.unwrap();

        let (channel, received) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("poll timed out")
                .expect("subscription closed");
        assert_eq!(channel, "agent-w1");
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_pattern_filters_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FileTransportConfig::new(dir.path());
        config.poll_interval = Duration::from_millis(20);
        let transport = FileTransport::new(config);

        let mut rx = transport.subscribe("system:*").await.unwrap();

        transport
            .publish("agent-w1", &envelope("hub", "unicast"))
            .await
            .unwrap();
        transport
            .publish("system:status", &envelope("hub", "status"))
            .await
            .unwrap();

        let (channel, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel, "system_status");

        // The unicast message must never arrive on this subscription.
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_each_message_delivered_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FileTransportConfig::new(dir.path());
        config.poll_interval = Duration::from_millis(20);
        let transport = FileTransport::new(config);

        let mut rx = transport.subscribe("*").await.unwrap();
        transport
            .publish("hub-broadcast", &envelope("hub", "first"))
            .await
            .unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Several more polls pass; the same file is not redelivered.
        let dup = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_old_messages_swept() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FileTransportConfig::new(dir.path());
        config.poll_interval = Duration::from_millis(20);
        config.message_max_age = Duration::from_millis(1);
        let transport = FileTransport::new(config.clone());

        transport
            .publish("hub-broadcast", &envelope("hub", "stale"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First poll sweeps the stale file instead of delivering it.
        let mut rx = transport.subscribe("*").await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err());

        let spool = dir.path().join("hub-broadcast");
        let remaining = std::fs::read_dir(&spool)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(remaining, 0);
    }
}
