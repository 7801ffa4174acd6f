//! Coordination keyspace.
//!
//! Key shapes used across the store. `:` is the separator everywhere;
//! file paths keep their `/` characters inside the middle segment.

pub const COORDINATION_MODE: &str = "coordination:mode";
pub const COORDINATION_HEALTH: &str = "coordination:redis_health";
pub const COORDINATION_HISTORY: &str = "coordination:history";
pub const AGENT_HEARTBEAT_INDEX: &str = "agents:heartbeats";

pub fn pr_cold_state(id: &str) -> String {
    format!("pr:{id}:cold_state")
}

pub fn pr_hot_state(id: &str) -> String {
    format!("pr:{id}:hot_state")
}

pub fn pr_agent(id: &str) -> String {
    format!("pr:{id}:agent")
}

pub fn pr_dependencies(id: &str) -> String {
    format!("pr:{id}:dependencies")
}

pub fn pr_leases(id: &str) -> String {
    format!("pr:{id}:leases")
}

pub fn pr_complexity(id: &str) -> String {
    format!("pr:{id}:complexity")
}

pub fn pr_tier(id: &str) -> String {
    format!("pr:{id}:tier")
}

pub fn pr_token_usage(id: &str) -> String {
    format!("pr:{id}:token_usage")
}

pub fn pr_cost(id: &str) -> String {
    format!("pr:{id}:cost")
}

pub fn file_lease(path: &str) -> String {
    format!("file:{path}:lease")
}

/// Monotonic fencing counter; outlives the lease itself.
pub fn file_fence(path: &str) -> String {
    format!("file:{path}:fence")
}

pub fn agent_heartbeat(id: &str) -> String {
    format!("agent:{id}:heartbeat")
}

pub fn agent_model(id: &str) -> String {
    format!("agent:{id}:model")
}

pub fn agent_current_pr(id: &str) -> String {
    format!("agent:{id}:current_pr")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(pr_cold_state("PR-001"), "pr:PR-001:cold_state");
        assert_eq!(file_lease("src/lib.rs"), "file:src/lib.rs:lease");
        assert_eq!(file_fence("src/lib.rs"), "file:src/lib.rs:fence");
        assert_eq!(agent_heartbeat("worker-agent-2"), "agent:worker-agent-2:heartbeat");
    }
}
