//! Hub configuration.
//!
//! Every interval and budget in one place, with the documented defaults.
//! The embedding binary may override any field before `Hub::start`.

use std::path::PathBuf;
use std::time::Duration;

use mergeflow_arbiter::{PairingTable, SchedulerConfig};
use mergeflow_bus::BusConfig;

/// Full hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Hub scratch directory: PID file, message spool, snapshots.
    pub work_dir: PathBuf,
    /// The source repository agents work against.
    pub repo_dir: PathBuf,
    /// Plan file name, relative to `repo_dir`.
    pub plan_file: String,
    /// Shared coordination store URL.
    pub store_url: String,

    /// Agents heartbeat on this interval.
    pub heartbeat_interval: Duration,
    /// Missed-heartbeat window before an agent counts as crashed.
    pub heartbeat_timeout: Duration,
    /// How long a freshly spawned agent has to register.
    pub registration_grace: Duration,

    /// Store probe cycle for mode detection.
    pub probe_interval: Duration,
    /// Minimum spacing between mode transitions.
    pub transition_cooldown: Duration,
    /// Consecutive probe failures before a downgrade.
    pub failure_threshold: u32,

    pub scheduler_interval: Duration,
    pub display_sync_interval: Duration,
    pub shutdown_timeout: Duration,
    pub shutdown_poll: Duration,

    pub pairings: PairingTable,
    pub scheduler: SchedulerConfig,
    pub bus: BusConfig,
    /// Per-channel persistence stream cap; None disables persistence.
    pub max_stream_len: Option<usize>,

    /// Worker binary the spawner launches.
    pub agent_program: PathBuf,
}

impl HubConfig {
    pub fn new(work_dir: impl Into<PathBuf>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            repo_dir: repo_dir.into(),
            plan_file: "mergeflow-plan.md".to_string(),
            store_url: "redis://127.0.0.1:6379".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            registration_grace: Duration::from_secs(5),
            probe_interval: Duration::from_secs(5),
            transition_cooldown: Duration::from_secs(10),
            failure_threshold: 3,
            scheduler_interval: Duration::from_secs(2),
            display_sync_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            shutdown_poll: Duration::from_secs(1),
            pairings: PairingTable::new(),
            scheduler: SchedulerConfig::default(),
            bus: BusConfig::default(),
            max_stream_len: Some(1_000),
            agent_program: PathBuf::from("mergeflow-agent"),
        }
    }

    pub fn pid_path(&self) -> PathBuf {
        self.work_dir.join(".hub.pid")
    }

    pub fn plan_path(&self) -> PathBuf {
        self.repo_dir.join(&self.plan_file)
    }

    pub fn message_dir(&self) -> PathBuf {
        self.work_dir.join("messages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::new("/tmp/hub", "/tmp/repo");
        assert_eq!(config.heartbeat_timeout, config.heartbeat_interval * 3);
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/hub/.hub.pid"));
        assert_eq!(
            config.plan_path(),
            PathBuf::from("/tmp/repo/mergeflow-plan.md")
        );
    }
}
