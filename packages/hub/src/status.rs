//! Aggregate status snapshot.
//!
//! Read-only view published on `system:status` for dashboards. Not part
//! of the coordination contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mergeflow_types::{AgentStatus, AgentInfo, CoordinationMode, Plan};

/// One status frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubStatus {
    pub mode: CoordinationMode,
    pub agents_total: usize,
    pub agents_idle: usize,
    pub agents_working: usize,
    pub agents_crashed: usize,
    /// Item counts keyed by cold-state name.
    pub items_by_state: HashMap<String, usize>,
    pub scheduler_passes: u64,
}

impl HubStatus {
    pub fn collect(
        mode: CoordinationMode,
        agents: &[AgentInfo],
        plan: &Plan,
        scheduler_passes: u64,
    ) -> Self {
        let mut items_by_state: HashMap<String, usize> = HashMap::new();
        for item in &plan.items {
            *items_by_state.entry(item.cold_state.to_string()).or_insert(0) += 1;
        }
        Self {
            mode,
            agents_total: agents.len(),
            agents_idle: agents.iter().filter(|a| a.status == AgentStatus::Idle).count(),
            agents_working: agents
                .iter()
                .filter(|a| a.status == AgentStatus::Working)
                .count(),
            agents_crashed: agents
                .iter()
                .filter(|a| a.status == AgentStatus::Crashed)
                .count(),
            items_by_state,
            scheduler_passes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mergeflow_types::{AgentType, ColdState, Tier, WorkItem};

    #[test]
    fn test_collect_counts() {
        let now = Utc::now();
        let mut working = AgentInfo::new("worker-agent-1", AgentType::Worker, Tier::Low, now);
        working.status = AgentStatus::Working;
        let idle = AgentInfo::new("worker-agent-2", AgentType::Worker, Tier::Low, now);

        let plan = Plan::new(vec![
            WorkItem::new("PR-001", "a").with_state(ColdState::Ready),
            WorkItem::new("PR-002", "b").with_state(ColdState::Ready),
            WorkItem::new("PR-003", "c").with_state(ColdState::Completed),
        ]);

        let status = HubStatus::collect(
            CoordinationMode::Distributed,
            &[working, idle],
            &plan,
            7,
        );
        assert_eq!(status.agents_working, 1);
        assert_eq!(status.agents_idle, 1);
        assert_eq!(status.items_by_state["ready"], 2);
        assert_eq!(status.items_by_state["completed"], 1);
        assert_eq!(status.scheduler_passes, 7);
    }
}
