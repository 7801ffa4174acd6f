//! Agent registry.
//!
//! In-memory authority on which agent processes exist, what they are
//! doing, and whether they are still alive. Crash detection is a pure
//! sweep over heartbeat ages against the injected clock; the hub
//! performs the actual reclamation so coordination keys stay under one
//! owner.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use mergeflow_types::{AgentInfo, AgentStatus, AgentType, Clock, Tier};

/// Registry protocol errors, reported back to the offending agent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("agent {agent_id} already registered under live pid {pid}")]
    AlreadyRegistered { agent_id: String, pid: u32 },

    #[error("unknown agent {agent_id}")]
    Unknown { agent_id: String },
}

/// Registered agent table.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: chrono::Duration,
}

impl AgentRegistry {
    pub fn new(clock: Arc<dyn Clock>, heartbeat_timeout: std::time::Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            clock,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
        }
    }

    /// Register an agent. Re-registration with the same pid inherits the
    /// existing record (heartbeat included). A different pid evicts the
    /// prior record unless that record is still heartbeating, which is a
    /// protocol violation.
    pub fn register(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        tier: Tier,
        pid: u32,
    ) -> Result<AgentInfo, RegistryError> {
        let now = self.clock.now();
        let mut agents = self.agents.write();

        if let Some(existing) = agents.get(agent_id) {
            if existing.pid == Some(pid) {
                tracing::debug!(agent_id = %agent_id, pid, "re-registration inherits record");
                return Ok(existing.clone());
            }
            let alive = existing.status != AgentStatus::Crashed
                && existing.heartbeat_age(now) < self.heartbeat_timeout;
            if alive {
                return Err(RegistryError::AlreadyRegistered {
                    agent_id: agent_id.to_string(),
                    pid: existing.pid.unwrap_or(0),
                });
            }
            tracing::info!(agent_id = %agent_id, old_pid = ?existing.pid, new_pid = pid, "evicting stale record");
            agents.remove(agent_id);
        }

        let info = AgentInfo::new(agent_id, agent_type, tier, now).with_pid(pid);
        agents.insert(agent_id.to_string(), info.clone());
        tracing::info!(agent_id = %agent_id, agent_type = %agent_type, pid, "agent registered");
        Ok(info)
    }

    /// Record a heartbeat and the agent's self-reported status.
    pub fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_pr: Option<String>,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now();
        let mut agents = self.agents.write();
        let agent = agents.get_mut(agent_id).ok_or_else(|| RegistryError::Unknown {
            agent_id: agent_id.to_string(),
        })?;

        agent.last_heartbeat = now;
        // A crashed verdict is only reversed by re-registration, and
        // shutdown is hub-initiated.
        if agent.status != AgentStatus::ShuttingDown && agent.status != AgentStatus::Crashed {
            if agent.status == AgentStatus::Working && status == AgentStatus::Idle {
                agent.idle_since = now;
            }
            agent.status = status;
            agent.assigned_pr = current_pr;
        }
        Ok(())
    }

    /// Bind an agent to an item at assignment time.
    pub fn mark_working(&self, agent_id: &str, pr_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write();
        let agent = agents.get_mut(agent_id).ok_or_else(|| RegistryError::Unknown {
            agent_id: agent_id.to_string(),
        })?;
        agent.status = AgentStatus::Working;
        agent.assigned_pr = Some(pr_id.to_string());
        Ok(())
    }

    /// Return an agent to the idle pool.
    pub fn mark_idle(&self, agent_id: &str) -> Result<(), RegistryError> {
        let now = self.clock.now();
        let mut agents = self.agents.write();
        let agent = agents.get_mut(agent_id).ok_or_else(|| RegistryError::Unknown {
            agent_id: agent_id.to_string(),
        })?;
        agent.status = AgentStatus::Idle;
        agent.assigned_pr = None;
        agent.idle_since = now;
        Ok(())
    }

    /// Flag every live agent as shutting down.
    pub fn mark_all_shutting_down(&self) {
        let mut agents = self.agents.write();
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Crashed {
                agent.status = AgentStatus::ShuttingDown;
            }
        }
    }

    /// Declare agents with stale heartbeats crashed and return them.
    /// Reclamation of their work is the caller's job.
    pub fn sweep(&self) -> Vec<AgentInfo> {
        let now = self.clock.now();
        let mut crashed = Vec::new();
        let mut agents = self.agents.write();
        for agent in agents.values_mut() {
            let sweepable =
                matches!(agent.status, AgentStatus::Idle | AgentStatus::Working);
            if sweepable && agent.heartbeat_age(now) > self.heartbeat_timeout {
                agent.status = AgentStatus::Crashed;
                crashed.push(agent.clone());
            }
        }
        for agent in &crashed {
            tracing::warn!(
                agent_id = %agent.id,
                assigned_pr = ?agent.assigned_pr,
                "agent missed heartbeat window, marked crashed"
            );
        }
        crashed
    }

    pub fn evict(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.write().remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        let mut all: Vec<AgentInfo> = self.agents.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Live agents only (not crashed, not shutting down).
    pub fn live(&self) -> Vec<AgentInfo> {
        self.list()
            .into_iter()
            .filter(|a| matches!(a.status, AgentStatus::Idle | AgentStatus::Working))
            .collect()
    }

    pub fn is_live(&self, agent_id: &str) -> bool {
        self.get(agent_id)
            .map(|a| matches!(a.status, AgentStatus::Idle | AgentStatus::Working))
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.agents.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mergeflow_types::ManualClock;
    use std::time::Duration;

    fn registry() -> (AgentRegistry, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let registry = AgentRegistry::new(Arc::new(clock.clone()), Duration::from_secs(90));
        (registry, clock)
    }

    #[test]
    fn test_register_and_reregister_same_pid() {
        let (registry, clock) = registry();
        let first = registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 42)
            .unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let second = registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 42)
            .unwrap();

        // Same pid inherits the record, heartbeat included.
        assert_eq!(second.last_heartbeat, first.last_heartbeat);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_reregister_live_agent_with_new_pid_rejected() {
        let (registry, _clock) = registry();
        registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 42)
            .unwrap();

        let err = registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 43)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { pid: 42, .. }));
    }

    #[test]
    fn test_reregister_stale_agent_evicts() {
        let (registry, clock) = registry();
        let first = registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 42)
            .unwrap();

        clock.advance(chrono::Duration::seconds(300));
        let fresh = registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 43)
            .unwrap();

        assert_ne!(fresh.last_heartbeat, first.last_heartbeat);
        assert_eq!(fresh.pid, Some(43));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_sweep_marks_crashed_after_timeout() {
        let (registry, clock) = registry();
        registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 42)
            .unwrap();
        registry.mark_working("worker-agent-1", "PR-001").unwrap();

        // Two heartbeat intervals: still fine.
        clock.advance(chrono::Duration::seconds(60));
        assert!(registry.sweep().is_empty());

        // Past the third: crashed, with its assignment attached.
        clock.advance(chrono::Duration::seconds(31));
        let crashed = registry.sweep();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].assigned_pr.as_deref(), Some("PR-001"));
        assert!(!registry.is_live("worker-agent-1"));

        // Sweep is idempotent.
        assert!(registry.sweep().is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_agent_alive() {
        let (registry, clock) = registry();
        registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 42)
            .unwrap();

        for _ in 0..5 {
            clock.advance(chrono::Duration::seconds(30));
            registry
                .heartbeat("worker-agent-1", AgentStatus::Idle, None)
                .unwrap();
        }
        assert!(registry.sweep().is_empty());
        assert!(registry.is_live("worker-agent-1"));
    }

    #[test]
    fn test_heartbeat_unknown_agent() {
        let (registry, _clock) = registry();
        let err = registry
            .heartbeat("ghost", AgentStatus::Idle, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unknown { .. }));
    }

    #[test]
    fn test_idle_since_updates_on_work_completion() {
        let (registry, clock) = registry();
        registry
            .register("worker-agent-1", AgentType::Worker, Tier::Mid, 42)
            .unwrap();
        registry.mark_working("worker-agent-1", "PR-001").unwrap();

        clock.advance(chrono::Duration::seconds(120));
        registry
            .heartbeat("worker-agent-1", AgentStatus::Idle, None)
            .unwrap();

        let agent = registry.get("worker-agent-1").unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.idle_since, clock.now());
    }
}
