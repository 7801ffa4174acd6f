//! Mergeflow: Bus Messages
//!
//! Every message shares one envelope (id, timestamp, from, optional to,
//! priority, TTL, correlation id) around a tagged payload variant.
//! Inbound payloads with an unknown tag decode as `Custom` so old hubs
//! tolerate new agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::agent::{AgentStatus, AgentType};
use crate::coordination::CoordinationMode;
use crate::work_item::{HotState, PlannedFile, Tier};

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a message id: `{unix_ms}-{counter}-{nonce}`.
pub fn next_message_id(now: DateTime<Utc>) -> String {
    let counter = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", now.timestamp_millis(), counter, &nonce[..8])
}

/// Delivery priority. The bus drains higher classes first when flushing
/// its transition queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// Tagged message body, one variant per message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Registration {
        agent_type: AgentType,
        tier: Tier,
        pid: u32,
    },
    Heartbeat {
        status: AgentStatus,
        current_pr: Option<String>,
    },
    Assignment {
        pr_id: String,
        /// Leased paths with their fencing tokens.
        fencing: HashMap<String, u64>,
    },
    Progress {
        pr_id: String,
        hot_state: HotState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
    },
    Complete {
        pr_id: String,
        actual_files: Vec<PlannedFile>,
    },
    Failed {
        pr_id: String,
        reason: String,
    },
    Shutdown {
        reason: String,
    },
    ModeChange {
        from: CoordinationMode,
        to: CoordinationMode,
        reason: String,
    },
    LeaseAcquired {
        holder: String,
        paths: Vec<String>,
    },
    LeaseReleased {
        holder: String,
        paths: Vec<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl Payload {
    /// Stable type tag, used for channel naming and dedup metrics.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Payload::Registration { .. } => "registration",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Assignment { .. } => "assignment",
            Payload::Progress { .. } => "progress",
            Payload::Complete { .. } => "complete",
            Payload::Failed { .. } => "failed",
            Payload::Shutdown { .. } => "shutdown",
            Payload::ModeChange { .. } => "mode_change",
            Payload::LeaseAcquired { .. } => "lease_acquired",
            Payload::LeaseReleased { .. } => "lease_released",
            Payload::Custom { .. } => "custom",
        }
    }
}

/// Shared message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Time-to-live in milliseconds; expired messages are discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(from: impl Into<String>, payload: Payload, now: DateTime<Utc>) -> Self {
        Self {
            id: next_message_id(now),
            timestamp: now,
            from: from.into(),
            to: None,
            priority: MessagePriority::default(),
            ttl_ms: None,
            correlation_id: None,
            payload,
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => (now - self.timestamp).num_milliseconds() > ttl as i64,
            None => false,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a wire message. Unknown payload tags fall back to `Custom`
    /// carrying the raw body so a default handler can route them.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(env) => Ok(env),
            Err(_) => {
                let loose: LooseEnvelope = serde_json::from_str(raw)?;
                let name = loose
                    .payload
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                Ok(Envelope {
                    id: loose.id,
                    timestamp: loose.timestamp,
                    from: loose.from,
                    to: loose.to,
                    priority: loose.priority,
                    ttl_ms: loose.ttl_ms,
                    correlation_id: loose.correlation_id,
                    payload: Payload::Custom {
                        name,
                        data: loose.payload,
                    },
                })
            }
        }
    }
}

/// Envelope with the payload left undecoded, for the unknown-tag path.
#[derive(Deserialize)]
struct LooseEnvelope {
    id: String,
    timestamp: DateTime<Utc>,
    from: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    priority: MessagePriority,
    #[serde(default)]
    ttl_ms: Option<u64>,
    #[serde(default)]
    correlation_id: Option<String>,
    payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_unique() {
        let now = Utc::now();
        let a = next_message_id(now);
        let b = next_message_id(now);
        assert_ne!(a, b);
    }

    #[test]
    fn test_envelope_round_trip() {
        let now = Utc::now();
        let env = Envelope::new(
            "hub",
            Payload::Assignment {
                pr_id: "PR-001".into(),
                fencing: HashMap::from([("src/a.rs".to_string(), 3u64)]),
            },
            now,
        )
        .to("worker-agent-1")
        .with_priority(MessagePriority::High);

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.payload.type_tag(), "assignment");
    }

    #[test]
    fn test_unknown_payload_decodes_as_custom() {
        let raw = r#"{
            "id": "1-0-abc",
            "timestamp": "2026-01-01T00:00:00Z",
            "from": "worker-agent-9",
            "priority": "normal",
            "payload": {"type": "telemetry_v2", "cpu": 0.3}
        }"#;

        let env = Envelope::decode(raw).unwrap();
        match env.payload {
            Payload::Custom { name, data } => {
                assert_eq!(name, "telemetry_v2");
                assert_eq!(data["cpu"], 0.3);
            }
            other => panic!("expected custom payload, got {other:?}"),
        }
    }

    #[test]
    fn test_ttl_expiry() {
        let now = Utc::now();
        let env = Envelope::new(
            "hub",
            Payload::Shutdown {
                reason: "test".into(),
            },
            now,
        )
        .with_ttl_ms(1_000);

        assert!(!env.is_expired(now));
        assert!(env.is_expired(now + chrono::Duration::milliseconds(1_001)));
    }
}
