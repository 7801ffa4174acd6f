//! KV store client.
//!
//! Three logical connections: one multiplexed command connection, one
//! publish connection, and on-demand subscriber connections. The command
//! path is gated by the latest health probe: while a probe inside
//! `health_window` has failed, every operation returns `Unavailable`
//! without touching the wire, leaving in-memory state intact.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mergeflow_types::StoreHealth;

use crate::error::StoreError;

const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ((cur == false and ARGV[1] == '') or cur == ARGV[1]) then
  if ARGV[3] ~= '' then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
  else
    redis.call('SET', KEYS[1], ARGV[2])
  end
  return 1
else
  return 0
end
"#;

const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct KvClientConfig {
    pub url: String,
    /// How often the background probe pings the store.
    pub probe_interval: Duration,
    /// A failed probe younger than this gates all commands.
    pub health_window: Duration,
    /// Per-command timeout.
    pub command_timeout: Duration,
}

impl Default for KvClientConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            probe_interval: Duration::from_secs(5),
            health_window: Duration::from_secs(15),
            command_timeout: Duration::from_secs(2),
        }
    }
}

/// Reconnecting client for the shared coordination store.
#[derive(Clone)]
pub struct KvClient {
    client: redis::Client,
    cmd: ConnectionManager,
    publisher: ConnectionManager,
    health: Arc<RwLock<StoreHealth>>,
    config: Arc<KvClientConfig>,
}

impl KvClient {
    /// Connect and perform an initial probe.
    pub async fn connect(config: KvClientConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str()).map_err(StoreError::unavailable)?;
        let cmd = client
            .get_connection_manager()
            .await
            .map_err(StoreError::unavailable)?;
        let publisher = client
            .get_connection_manager()
            .await
            .map_err(StoreError::unavailable)?;

        let kv = Self {
            client,
            cmd,
            publisher,
            health: Arc::new(RwLock::new(StoreHealth::healthy(Utc::now(), 0))),
            config: Arc::new(config),
        };
        kv.probe().await;
        Ok(kv)
    }

    pub fn config(&self) -> &KvClientConfig {
        &self.config
    }

    /// Latest probe result.
    pub fn health(&self) -> StoreHealth {
        *self.health.read()
    }

    /// PING the store and record the outcome.
    pub async fn probe(&self) -> StoreHealth {
        let started = std::time::Instant::now();
        let mut con = self.cmd.clone();
        let outcome = tokio::time::timeout(
            self.config.command_timeout,
            redis::cmd("PING").query_async::<String>(&mut con),
        )
        .await;

        let health = match outcome {
            Ok(Ok(_)) => StoreHealth::healthy(Utc::now(), started.elapsed().as_millis() as u64),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "store probe failed");
                StoreHealth::unhealthy(Utc::now())
            }
            Err(_) => {
                tracing::warn!("store probe timed out");
                StoreHealth::unhealthy(Utc::now())
            }
        };
        *self.health.write() = health;
        health
    }

    /// Probe on `probe_interval` until the handle is aborted.
    pub fn spawn_probe_loop(&self) -> JoinHandle<()> {
        let kv = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(kv.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                kv.probe().await;
            }
        })
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        let health = self.health.read();
        if !health.healthy {
            let age = Utc::now() - health.checked_at;
            if age
                < chrono::Duration::from_std(self.config.health_window)
                    .unwrap_or_else(|_| chrono::Duration::seconds(15))
            {
                return Err(StoreError::Unavailable {
                    reason: "health probe failing".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Unavailable {
                reason: "command timed out".to_string(),
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        self.with_timeout(con.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        self.with_timeout(con.set(key, value)).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        self.with_timeout(con.set_ex(key, value, ttl_secs)).await
    }

    /// SET if absent, with TTL. Returns false when the key already exists.
    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let reply: Option<String> = self
            .with_timeout(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut con),
            )
            .await?;
        Ok(reply.is_some())
    }

    /// Delete; returns whether a key was removed.
    pub async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let removed: i64 = self.with_timeout(con.del(key)).await?;
        Ok(removed > 0)
    }

    /// Atomic compare-and-set. `expected = None` requires the key to be
    /// absent. Fails with `Conflict` on a mismatch.
    pub async fn cas(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let script = redis::Script::new(CAS_SCRIPT);
        let ttl = ttl_secs.map(|t| t.to_string()).unwrap_or_default();
        let won: i64 = self
            .with_timeout(
                script
                    .key(key)
                    .arg(expected.unwrap_or(""))
                    .arg(new)
                    .arg(ttl)
                    .invoke_async(&mut con),
            )
            .await?;
        if won == 1 {
            Ok(())
        } else {
            Err(StoreError::Conflict {
                key: key.to_string(),
            })
        }
    }

    /// Delete only when the current value matches. Returns false on miss.
    pub async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let script = redis::Script::new(DEL_IF_EQ_SCRIPT);
        let removed: i64 = self
            .with_timeout(script.key(key).arg(expected).invoke_async(&mut con))
            .await?;
        Ok(removed > 0)
    }

    /// Counter increment; creates the key at 0 first.
    pub async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        self.with_timeout(con.incr(key, by)).await
    }

    pub async fn incr_float(&self, key: &str, by: f64) -> Result<f64, StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        self.with_timeout(
            redis::cmd("INCRBYFLOAT")
                .arg(key)
                .arg(by)
                .query_async(&mut con),
        )
        .await
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let _: bool = self.with_timeout(con.expire(key, ttl_secs as i64)).await?;
        Ok(())
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let _: i64 = self.with_timeout(con.zadd(key, member, score)).await?;
        Ok(())
    }

    /// Newest-first range.
    pub async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        self.with_timeout(con.zrevrange(key, 0, limit as isize - 1))
            .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let _: i64 = self.with_timeout(con.zrem(key, member)).await?;
        Ok(())
    }

    /// Append to a stream with approximate length trimming.
    pub async fn xadd_trimmed(
        &self,
        stream: &str,
        max_len: usize,
        payload: &str,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.cmd.clone();
        let _: String = self
            .with_timeout(
                redis::cmd("XADD")
                    .arg(stream)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(max_len)
                    .arg("*")
                    .arg("message")
                    .arg(payload)
                    .query_async(&mut con),
            )
            .await?;
        Ok(())
    }

    /// Publish on the dedicated publish connection.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut con = self.publisher.clone();
        let _: i64 = self.with_timeout(con.publish(channel, payload)).await?;
        Ok(())
    }

    /// Pattern-subscribe on a fresh connection. Messages arrive as
    /// `(channel, payload)` until the connection drops or the handle is
    /// aborted.
    pub async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<(mpsc::Receiver<(String, String)>, JoinHandle<()>), StoreError> {
        self.ensure_available()?;
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(StoreError::unavailable)?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(StoreError::unavailable)?;

        let (tx, rx) = mpsc::channel(256);
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::warn!(channel = %channel, error = %err, "dropping undecodable message");
                        continue;
                    }
                };
                if tx.send((channel, payload)).await.is_err() {
                    break;
                }
            }
        });
        Ok((rx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KvClientConfig::default();
        assert_eq!(config.probe_interval, Duration::from_secs(5));
        assert!(config.health_window > config.probe_interval);
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_unavailable() {
        // Port 1 is never a redis server.
        let config = KvClientConfig {
            url: "redis://127.0.0.1:1".to_string(),
            ..KvClientConfig::default()
        };
        match KvClient::connect(config).await {
            Err(StoreError::Unavailable { .. }) => {}
            Err(other) => panic!("expected Unavailable, got {other:?}"),
            Ok(_) => panic!("expected connection failure"),
        }
    }
}
