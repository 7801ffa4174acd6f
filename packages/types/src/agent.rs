//! Mergeflow: Agent Model
//!
//! Agents are worker processes spawned by the hub. A single concrete
//! process type is parameterized by a role and a capability record; the
//! hub never dispatches on anything but capabilities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::work_item::Tier;

/// Role an agent process was spawned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Worker,
    Qc,
    Planning,
    Review,
}

impl AgentType {
    /// Default capability record for the role.
    pub fn capabilities(self, tier: Tier) -> Capabilities {
        match self {
            AgentType::Worker => Capabilities {
                languages: Vec::new(),
                can_plan: false,
                can_implement: true,
                can_test: true,
                tier,
            },
            AgentType::Qc => Capabilities {
                languages: Vec::new(),
                can_plan: false,
                can_implement: false,
                can_test: true,
                tier,
            },
            AgentType::Planning => Capabilities {
                languages: Vec::new(),
                can_plan: true,
                can_implement: false,
                can_test: false,
                tier,
            },
            AgentType::Review => Capabilities {
                languages: Vec::new(),
                can_plan: false,
                can_implement: false,
                can_test: false,
                tier,
            },
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentType::Worker => "worker",
            AgentType::Qc => "qc",
            AgentType::Planning => "planning",
            AgentType::Review => "review",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "worker" => Ok(AgentType::Worker),
            "qc" => Ok(AgentType::Qc),
            "planning" => Ok(AgentType::Planning),
            "review" => Ok(AgentType::Review),
            other => Err(format!("unknown agent type '{other}'")),
        }
    }
}

/// What an agent is able to do. Polymorphism over this record, not over
/// process types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub languages: Vec<String>,
    pub can_plan: bool,
    pub can_implement: bool,
    pub can_test: bool,
    pub tier: Tier,
}

/// Runtime status of an agent as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Crashed,
    ShuttingDown,
}

/// Registry record for one agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: AgentType,
    pub capabilities: Capabilities,
    pub status: AgentStatus,
    /// Work item currently assigned, if any.
    pub assigned_pr: Option<String>,
    /// OS process id, used to disambiguate re-registrations.
    pub pid: Option<u32>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// When the agent last went idle; oldest-idle wins assignment ties.
    pub idle_since: DateTime<Utc>,
}

impl AgentInfo {
    pub fn new(id: impl Into<String>, agent_type: AgentType, tier: Tier, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            agent_type,
            capabilities: agent_type.capabilities(tier),
            status: AgentStatus::Idle,
            assigned_pr: None,
            pid: None,
            last_heartbeat: now,
            started_at: now,
            idle_since: now,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn tier(&self) -> Tier {
        self.capabilities.tier
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    /// Heartbeat age against `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_by_role() {
        let w = AgentType::Worker.capabilities(Tier::Mid);
        assert!(w.can_implement && w.can_test && !w.can_plan);

        let p = AgentType::Planning.capabilities(Tier::High);
        assert!(p.can_plan && !p.can_implement);
        assert_eq!(p.tier, Tier::High);
    }

    #[test]
    fn test_agent_type_round_trip() {
        for t in ["worker", "qc", "planning", "review"] {
            let parsed: AgentType = t.parse().unwrap();
            assert_eq!(parsed.to_string(), t);
        }
    }

    #[test]
    fn test_heartbeat_age() {
        let now = Utc::now();
        let agent = AgentInfo::new("worker-agent-1", AgentType::Worker, Tier::Low, now);
        let later = now + chrono::Duration::seconds(90);
        assert_eq!(agent.heartbeat_age(later).num_seconds(), 90);
    }
}
