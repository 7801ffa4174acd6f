//! Coordination mode manager.
//!
//! Probes the shared store on a fixed cycle and walks the hub between
//! distributed, degraded, and isolated operation. Three consecutive
//! probe failures downgrade one step; a single success proposes an
//! upgrade, gated by a cooldown so alternating probe results cannot
//! flap the mode. Only adjacent transitions exist.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mergeflow_bus::{channels, FileTransport, MessageBus, RedisTransport, Transport};
use mergeflow_repo::{GitRepo, MergeOutcome};
use mergeflow_store::StateStore;
use mergeflow_types::{
    Clock, CoordinationMode, Envelope, ModeTransition, Payload, TransitionRing,
};

use crate::sync::StateSync;

const HUB_SENDER: &str = "hub";
const DEGRADED_METADATA_KEY: &str = "coordination:degraded_since";

/// Mode manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    #[error("transition cooldown active")]
    CooldownActive,

    #[error("store probe failed")]
    ProbeFailed,

    #[error("transition action '{action}' failed: {reason}")]
    TransitionActionFailed { action: String, reason: String },
}

/// Pure detection state machine: consecutive probe outcomes in,
/// proposed transitions out.
#[derive(Debug)]
pub struct ModeDetector {
    mode: CoordinationMode,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    cooldown: chrono::Duration,
    last_transition: Option<DateTime<Utc>>,
}

impl ModeDetector {
    pub fn new(
        initial: CoordinationMode,
        failure_threshold: u32,
        cooldown: std::time::Duration,
    ) -> Self {
        Self {
            mode: initial,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            last_transition: None,
        }
    }

    pub fn mode(&self) -> CoordinationMode {
        self.mode
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_transition
            .map(|at| now - at < self.cooldown)
            .unwrap_or(false)
    }

    /// Feed one probe outcome; returns a proposed adjacent transition.
    pub fn observe(
        &mut self,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> Option<(CoordinationMode, CoordinationMode)> {
        if healthy {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if self.consecutive_successes >= 1 && !self.in_cooldown(now) {
                return self.mode.upgraded().map(|to| (self.mode, to));
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.consecutive_failures >= self.failure_threshold && !self.in_cooldown(now) {
                return self.mode.downgraded().map(|to| (self.mode, to));
            }
        }
        None
    }

    /// Commit a completed transition.
    pub fn record_transition(&mut self, to: CoordinationMode, now: DateTime<Utc>) {
        self.mode = to;
        self.last_transition = Some(now);
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

/// Drives mode detection and executes transition action lists.
pub struct ModeManager {
    detector: Mutex<ModeDetector>,
    ring: Mutex<TransitionRing>,
    store: StateStore,
    bus: MessageBus,
    repo: GitRepo,
    sync: Arc<StateSync>,
    redis_transport: Arc<RedisTransport>,
    file_transport: Arc<FileTransport>,
    clock: Arc<dyn Clock>,
    mode_tx: watch::Sender<CoordinationMode>,
}

impl ModeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial: CoordinationMode,
        failure_threshold: u32,
        cooldown: std::time::Duration,
        store: StateStore,
        bus: MessageBus,
        repo: GitRepo,
        sync: Arc<StateSync>,
        redis_transport: Arc<RedisTransport>,
        file_transport: Arc<FileTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (mode_tx, _) = watch::channel(initial);
        Self {
            detector: Mutex::new(ModeDetector::new(initial, failure_threshold, cooldown)),
            ring: Mutex::new(TransitionRing::default()),
            store,
            bus,
            repo,
            sync,
            redis_transport,
            file_transport,
            clock,
            mode_tx,
        }
    }

    pub fn current_mode(&self) -> CoordinationMode {
        *self.mode_tx.borrow()
    }

    /// Watch channel for mode changes.
    pub fn subscribe(&self) -> watch::Receiver<CoordinationMode> {
        self.mode_tx.subscribe()
    }

    pub fn history(&self) -> Vec<ModeTransition> {
        self.ring.lock().iter().cloned().collect()
    }

    /// One probe cycle.
    pub async fn tick(&self) {
        let health = self.store.kv().probe().await;
        if health.healthy {
            let _ = self.store.record_store_health(health).await;
        }

        let now = self.clock.now();
        let proposal = self.detector.lock().observe(health.healthy, now);
        let Some((from, to)) = proposal else {
            return;
        };

        let reason = if health.healthy {
            "store probe recovered".to_string()
        } else {
            "store probe failing".to_string()
        };
        match self.apply_transition(from, to, &reason).await {
            Ok(()) => {
                let now = self.clock.now();
                self.detector.lock().record_transition(to, now);
                let transition = ModeTransition {
                    from,
                    to,
                    reason: reason.clone(),
                    at: now,
                };
                self.ring.lock().push(transition.clone());
                let _ = self.store.push_history(&transition).await;
                let _ = self.mode_tx.send(to);
                tracing::info!(%from, %to, %reason, "coordination mode changed");

                let event = Envelope::new(
                    HUB_SENDER,
                    Payload::ModeChange {
                        from,
                        to,
                        reason,
                    },
                    now,
                );
                let _ = self
                    .bus
                    .publish(&channels::coordination_channel("mode-change"), event.clone())
                    .await;
                let _ = self.bus.publish(channels::HUB_BROADCAST, event).await;
            }
            Err(err) => {
                tracing::error!(%from, %to, error = %err, "mode transition failed, mode unchanged");
                let event = Envelope::new(
                    HUB_SENDER,
                    Payload::Custom {
                        name: "transition-failed".to_string(),
                        data: serde_json::json!({
                            "from": from.to_string(),
                            "to": to.to_string(),
                            "error": err.to_string(),
                        }),
                    },
                    self.clock.now(),
                );
                let _ = self
                    .bus
                    .publish(&channels::system_channel("transition-failed"), event)
                    .await;
            }
        }
    }

    /// Probe on `interval` until aborted.
    pub fn spawn_loop(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.tick().await;
            }
        })
    }

    async fn notify(&self, name: &str) {
        let event = Envelope::new(
            HUB_SENDER,
            Payload::Custom {
                name: name.to_string(),
                data: serde_json::Value::Null,
            },
            self.clock.now(),
        );
        if let Err(err) = self.bus.publish(channels::HUB_BROADCAST, event).await {
            tracing::warn!(action = %name, error = %err, "agent notification failed");
        }
    }

    /// Ordered, idempotent action list per transition edge. An error
    /// leaves the mode where it was.
    async fn apply_transition(
        &self,
        from: CoordinationMode,
        to: CoordinationMode,
        reason: &str,
    ) -> Result<(), ModeError> {
        use CoordinationMode::*;
        tracing::info!(%from, %to, %reason, "applying mode transition");

        match (from, to) {
            (Distributed, Degraded) => {
                // Local-store provisioning belongs to the operating
                // integration layer; from here the shared store is simply
                // gone. Agents move onto their own branches.
                self.notify("switch-to-branches").await;
                if let Err(err) = self.sync.hydrate().await {
                    tracing::warn!(error = %err, "store hydration deferred until reachable");
                }
                let _ = self
                    .store
                    .kv()
                    .set(DEGRADED_METADATA_KEY, &self.clock.now().to_rfc3339())
                    .await;
                Ok(())
            }
            (Degraded, Isolated) => {
                self.sync
                    .save_snapshot()
                    .await
                    .map_err(|e| ModeError::TransitionActionFailed {
                        action: "save-snapshot".to_string(),
                        reason: e.to_string(),
                    })?;
                self.bus.begin_transition();
                self.notify("work-isolated").await;
                let file_transport: Arc<dyn Transport> = self.file_transport.clone();
                self.bus
                    .complete_transition(file_transport)
                    .await
                    .map_err(|e| {
                        self.bus.abort_transition();
                        ModeError::TransitionActionFailed {
                            action: "switch-bus-to-files".to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                Ok(())
            }
            (Isolated, Degraded) => {
                self.bus.begin_transition();
                self.sync
                    .hydrate()
                    .await
                    .map_err(|e| {
                        self.bus.abort_transition();
                        ModeError::TransitionActionFailed {
                            action: "rehydrate-store".to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                self.notify("resume-coordination").await;
                // Re-attaching the store transport also replays messages
                // still queued from the isolated window.
                let redis_transport: Arc<dyn Transport> = self.redis_transport.clone();
                self.bus
                    .complete_transition(redis_transport)
                    .await
                    .map_err(|e| {
                        self.bus.abort_transition();
                        ModeError::TransitionActionFailed {
                            action: "switch-bus-to-store".to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                Ok(())
            }
            (Degraded, Distributed) => {
                self.reconcile_branches().await?;
                let _ = self.store.kv().del(DEGRADED_METADATA_KEY).await;
                self.notify("resume-main-branch").await;
                Ok(())
            }
            _ => Err(ModeError::TransitionActionFailed {
                action: "adjacency-check".to_string(),
                reason: format!("non-adjacent transition {from} -> {to}"),
            }),
        }
    }

    /// Merge every agent branch back; conflicts leave the branch intact
    /// and surface a conflict report.
    async fn reconcile_branches(&self) -> Result<(), ModeError> {
        let branches = self.repo.list_agent_branches().await.map_err(|e| {
            ModeError::TransitionActionFailed {
                action: "list-agent-branches".to_string(),
                reason: e.to_string(),
            }
        })?;

        for branch in branches {
            match self.repo.merge_branch(&branch).await {
                Ok(MergeOutcome::Merged { branch }) => {
                    tracing::info!(%branch, "agent branch merged");
                    let _ = self.repo.delete_branch(&branch).await;
                }
                Ok(MergeOutcome::Conflicted {
                    branch,
                    conflicting_paths,
                }) => {
                    tracing::warn!(%branch, paths = ?conflicting_paths, "agent branch left unmerged");
                    let event = Envelope::new(
                        HUB_SENDER,
                        Payload::Custom {
                            name: "conflict".to_string(),
                            data: serde_json::json!({
                                "branch": branch,
                                "paths": conflicting_paths,
                            }),
                        },
                        self.clock.now(),
                    );
                    let _ = self
                        .bus
                        .publish(&channels::system_channel("conflict"), event)
                        .await;
                }
                Err(err) => {
                    return Err(ModeError::TransitionActionFailed {
                        action: format!("merge-{branch}"),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(cooldown_secs: u64) -> ModeDetector {
        ModeDetector::new(
            CoordinationMode::Distributed,
            3,
            std::time::Duration::from_secs(cooldown_secs),
        )
    }

    #[test]
    fn test_three_failures_propose_downgrade() {
        let mut d = detector(10);
        let now = Utc::now();

        assert_eq!(d.observe(false, now), None);
        assert_eq!(d.observe(false, now), None);
        assert_eq!(
            d.observe(false, now),
            Some((CoordinationMode::Distributed, CoordinationMode::Degraded))
        );
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut d = detector(10);
        let now = Utc::now();

        d.observe(false, now);
        d.observe(false, now);
        d.observe(true, now);
        assert_eq!(d.observe(false, now), None);
        assert_eq!(d.observe(false, now), None);
        assert!(d.observe(false, now).is_some());
    }

    #[test]
    fn test_single_success_proposes_upgrade_after_cooldown() {
        let mut d = detector(10);
        let start = Utc::now();

        for _ in 0..3 {
            d.observe(false, start);
        }
        d.record_transition(CoordinationMode::Degraded, start);

        // Inside cooldown: no upgrade.
        assert_eq!(d.observe(true, start + chrono::Duration::seconds(5)), None);

        // After cooldown: one success is enough.
        assert_eq!(
            d.observe(true, start + chrono::Duration::seconds(11)),
            Some((CoordinationMode::Degraded, CoordinationMode::Distributed))
        );
    }

    #[test]
    fn test_flapping_inside_cooldown_produces_nothing() {
        let mut d = detector(60);
        let start = Utc::now();
        d.record_transition(CoordinationMode::Degraded, start);

        let mut t = start;
        for round in 0..10 {
            t += chrono::Duration::seconds(5);
            let healthy = round % 2 == 0;
            assert_eq!(d.observe(healthy, t), None, "round {round}");
        }
        assert_eq!(d.mode(), CoordinationMode::Degraded);
    }

    #[test]
    fn test_no_downgrade_below_isolated() {
        let mut d = ModeDetector::new(
            CoordinationMode::Isolated,
            3,
            std::time::Duration::from_secs(0),
        );
        let now = Utc::now();
        for _ in 0..10 {
            assert_eq!(d.observe(false, now), None);
        }
    }

    #[test]
    fn test_transitions_are_adjacent_only() {
        let mut d = detector(0);
        let now = Utc::now();

        for _ in 0..3 {
            d.observe(false, now);
        }
        d.record_transition(CoordinationMode::Degraded, now);

        // Still failing: the next step is isolated, not a jump.
        let later = now + chrono::Duration::seconds(1);
        for _ in 0..2 {
            assert_eq!(d.observe(false, later), None);
        }
        assert_eq!(
            d.observe(false, later),
            Some((CoordinationMode::Degraded, CoordinationMode::Isolated))
        );
    }
}
