//! Agent spawner.
//!
//! Launches worker processes with a deterministic identity and the
//! environment contract they expect. The spawner does not supervise:
//! liveness is the registry's job, through heartbeats.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use mergeflow_types::{AgentType, Tier};

use crate::error::HubError;

/// Environment variables handed to every agent process.
pub const ENV_AGENT_ID: &str = "AGENT_ID";
pub const ENV_AGENT_TYPE: &str = "AGENT_TYPE";
pub const ENV_STORE_URL: &str = "MERGEFLOW_STORE_URL";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "MERGEFLOW_HEARTBEAT_INTERVAL_MS";
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "MERGEFLOW_HEARTBEAT_TIMEOUT_MS";

/// Spawner configuration.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    pub program: PathBuf,
    pub store_url: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

/// A launched agent process.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub tier: Tier,
    pub pid: u32,
}

/// Launches agents with monotonic per-type identifiers.
pub struct AgentSpawner {
    config: SpawnerConfig,
    counters: Mutex<HashMap<AgentType, u64>>,
}

impl AgentSpawner {
    pub fn new(config: SpawnerConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic id format: `{type}-agent-{n}`, n monotonic per type.
    pub fn next_id(&self, agent_type: AgentType) -> String {
        let mut counters = self.counters.lock();
        let n = counters.entry(agent_type).or_insert(0);
        *n += 1;
        format!("{agent_type}-agent-{n}")
    }

    /// Launch one agent process. Stdout/stderr are mirrored into the
    /// hub's log stream for diagnosis.
    pub async fn spawn(
        &self,
        agent_type: AgentType,
        tier: Tier,
    ) -> Result<SpawnedAgent, HubError> {
        let agent_id = self.next_id(agent_type);

        let mut command = Command::new(&self.config.program);
        command
            .env(ENV_AGENT_ID, &agent_id)
            .env(ENV_AGENT_TYPE, agent_type.to_string())
            .env(ENV_STORE_URL, &self.config.store_url)
            .env(
                ENV_HEARTBEAT_INTERVAL_MS,
                self.config.heartbeat_interval_ms.to_string(),
            )
            .env(
                ENV_HEARTBEAT_TIMEOUT_MS,
                self.config.heartbeat_timeout_ms.to_string(),
            )
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| HubError::SpawnFailed {
            agent_type: agent_type.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| HubError::SpawnFailed {
            agent_type: agent_type.to_string(),
            reason: "process exited before pid was known".to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            let id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(agent_id = %id, "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(agent_id = %id, "{line}");
                }
            });
        }

        // Detach; the registry decides life and death from heartbeats.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(%status, "agent process exited"),
                Err(err) => tracing::warn!(error = %err, "agent process wait failed"),
            }
        });

        tracing::info!(agent_id = %agent_id, agent_type = %agent_type, pid, "agent spawned");
        Ok(SpawnedAgent {
            agent_id,
            agent_type,
            tier,
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawner(program: &str) -> AgentSpawner {
        AgentSpawner::new(SpawnerConfig {
            program: PathBuf::from(program),
            store_url: "redis://127.0.0.1:6379".to_string(),
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            working_dir: None,
        })
    }

    #[test]
    fn test_ids_are_monotonic_per_type() {
        let spawner = spawner("true");
        assert_eq!(spawner.next_id(AgentType::Worker), "worker-agent-1");
        assert_eq!(spawner.next_id(AgentType::Worker), "worker-agent-2");
        assert_eq!(spawner.next_id(AgentType::Qc), "qc-agent-1");
        assert_eq!(spawner.next_id(AgentType::Worker), "worker-agent-3");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let spawner = spawner("/nonexistent/mergeflow-agent");
        let err = spawner.spawn(AgentType::Worker, Tier::Low).await.unwrap_err();
        assert!(matches!(err, HubError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_real_process() {
        // `true` exits immediately; the spawner still hands back identity.
        let spawner = spawner("true");
        match spawner.spawn(AgentType::Worker, Tier::Low).await {
            Ok(spawned) => {
                assert_eq!(spawned.agent_id, "worker-agent-1");
                assert!(spawned.pid > 0);
            }
            // Hosts without /usr/bin/true in PATH skip quietly.
            Err(HubError::SpawnFailed { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
}
