//! State synchronization.
//!
//! Keeps the two views of work-item state honest with each other. The
//! repository is always the source of truth for cold state; the store
//! only ever wins for hot state, and then only while the holder is
//! still heartbeating. Reconciliation runs at startup and after every
//! mode transition; display sync repaints the plan file for operators;
//! cold sync commits durable state.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use mergeflow_bus::{channels, MessageBus};
use mergeflow_repo::{GitRepo, HotAnnotation, PlanFile, RepoError};
use mergeflow_store::{StateStore, StoreError};
use mergeflow_types::{Clock, ColdState, Envelope, HotState, Payload, Plan};

use crate::registry::AgentRegistry;

/// How a store record disagrees with the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Known item absent from the store; hydrated from the repo.
    StoreMissing,
    /// Hot state with no live claim behind it; cleared.
    StoreOrphaned,
    /// Holder stopped heartbeating; hot state cleared.
    HeartbeatExpired,
    /// Two non-completed claims on one item; operator intervention.
    ConcurrentUpdate,
    /// Store cold state diverged from the repository; repo wins.
    HotColdDivergence,
}

/// One reconciliation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub pr_id: String,
    pub kind: ConflictKind,
    pub detail: String,
}

/// Classify one item's store records against the plan. Pure; the
/// resolution side effects live in `StateSync::reconcile`.
pub fn classify(
    plan_cold: ColdState,
    store_cold: Option<ColdState>,
    hot: Option<HotState>,
    assigned_agent: Option<&str>,
    holder_live: bool,
    duplicate_claim: bool,
) -> Option<ConflictKind> {
    if duplicate_claim {
        return Some(ConflictKind::ConcurrentUpdate);
    }
    match store_cold {
        None => return Some(ConflictKind::StoreMissing),
        Some(stored) if stored != plan_cold => return Some(ConflictKind::HotColdDivergence),
        Some(_) => {}
    }
    if hot.is_some() {
        if plan_cold.is_done() || assigned_agent.is_none() {
            return Some(ConflictKind::StoreOrphaned);
        }
        if !holder_live {
            return Some(ConflictKind::HeartbeatExpired);
        }
    }
    None
}

/// Durable snapshot written when coordination drops to isolated mode.
#[derive(Debug, Serialize, Deserialize)]
struct IsolatedSnapshot {
    saved_at: chrono::DateTime<chrono::Utc>,
    items: Vec<SnapshotItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotItem {
    pr_id: String,
    cold_state: ColdState,
}

/// Hot/cold synchronization engine.
pub struct StateSync {
    store: StateStore,
    repo: GitRepo,
    plan_file: PlanFile,
    plan_rel: String,
    plan: Arc<RwLock<Plan>>,
    bus: MessageBus,
    registry: Arc<AgentRegistry>,
    clock: Arc<dyn Clock>,
    snapshot_path: PathBuf,
}

impl StateSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        repo: GitRepo,
        plan_file: PlanFile,
        plan_rel: String,
        plan: Arc<RwLock<Plan>>,
        bus: MessageBus,
        registry: Arc<AgentRegistry>,
        clock: Arc<dyn Clock>,
        snapshot_path: PathBuf,
    ) -> Self {
        Self {
            store,
            repo,
            plan_file,
            plan_rel,
            plan,
            bus,
            registry,
            clock,
            snapshot_path,
        }
    }

    pub fn plan(&self) -> Arc<RwLock<Plan>> {
        Arc::clone(&self.plan)
    }

    /// Seed the store from the repository's view.
    pub async fn hydrate(&self) -> Result<(), StoreError> {
        let plan = self.plan.read().await;
        for item in &plan.items {
            self.store.hydrate_item(item).await?;
        }
        tracing::info!(items = plan.len(), "store hydrated from plan");
        Ok(())
    }

    /// Compare store records to the plan, repair what has a policy, and
    /// report everything.
    pub async fn reconcile(&self) -> Result<Vec<ConflictReport>, StoreError> {
        let plan = self.plan.read().await.clone();
        let mut reports = Vec::new();

        // Agents claiming the same item concurrently.
        let mut claims: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        for agent in self.registry.live() {
            if let Some(pr) = agent.assigned_pr {
                claims.entry(pr).or_default().push(agent.id);
            }
        }

        for item in &plan.items {
            let store_cold = self.store.load_cold_state(&item.id).await?;
            let hot = self.store.load_hot_state(&item.id).await?;
            let assigned = self.store.assigned_agent(&item.id).await?;
            let holder_live = match assigned.as_deref() {
                Some(agent) => self.holder_live(agent).await?,
                None => false,
            };
            let duplicate = claims.get(&item.id).map(|c| c.len() > 1).unwrap_or(false);

            let Some(kind) = classify(
                item.cold_state,
                store_cold,
                hot,
                assigned.as_deref(),
                holder_live,
                duplicate,
            ) else {
                continue;
            };

            let detail = match kind {
                ConflictKind::StoreMissing => {
                    self.store.hydrate_item(item).await?;
                    "hydrated from repository".to_string()
                }
                ConflictKind::HotColdDivergence => {
                    self.store.hydrate_item(item).await?;
                    format!(
                        "store said {}, repository says {}",
                        store_cold.map(|s| s.to_string()).unwrap_or_default(),
                        item.cold_state
                    )
                }
                ConflictKind::StoreOrphaned => {
                    self.store.clear_hot_state(&item.id).await?;
                    "cleared orphaned hot state".to_string()
                }
                ConflictKind::HeartbeatExpired => {
                    self.store.clear_hot_state(&item.id).await?;
                    format!("holder {} stopped heartbeating", assigned.unwrap_or_default())
                }
                ConflictKind::ConcurrentUpdate => {
                    // No automatic winner; leave both claims for the
                    // operator.
                    format!("claimed by {:?}", claims.get(&item.id).unwrap())
                }
            };

            tracing::warn!(pr_id = %item.id, kind = ?kind, %detail, "reconciliation conflict");
            reports.push(ConflictReport {
                pr_id: item.id.clone(),
                kind,
                detail,
            });
        }

        for report in &reports {
            let event = Envelope::new(
                "hub",
                Payload::Custom {
                    name: "conflict".to_string(),
                    data: serde_json::to_value(report).unwrap_or_default(),
                },
                self.clock.now(),
            );
            let _ = self
                .bus
                .publish(&channels::system_channel("conflict"), event)
                .await;
        }
        Ok(reports)
    }

    async fn holder_live(&self, agent_id: &str) -> Result<bool, StoreError> {
        if self.registry.is_live(agent_id) {
            return Ok(true);
        }
        // An agent from a previous hub generation is live if its store
        // heartbeat is fresh (the key carries its own TTL).
        Ok(self.store.load_heartbeat(agent_id).await?.is_some())
    }

    /// Repaint the plan file with live hot-state annotations.
    pub async fn display_sync(&self) -> Result<(), RepoError> {
        let plan = self.plan.read().await.clone();
        let mut annotations = std::collections::HashMap::new();

        for item in &plan.items {
            let hot = match self.store.load_hot_state(&item.id).await {
                Ok(hot) => hot,
                Err(err) => {
                    tracing::debug!(error = %err, "display sync skipped, store unreachable");
                    return Ok(());
                }
            };
            if let Some(hot_state) = hot {
                let agent = self
                    .store
                    .assigned_agent(&item.id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                annotations.insert(item.id.clone(), HotAnnotation { hot_state, agent });
            }
        }

        self.plan_file.write_annotated(&plan, &annotations).await
    }

    /// Persist cold state and commit it.
    pub async fn cold_sync(&self, message: &str) -> Result<(), RepoError> {
        let plan = self.plan.read().await.clone();
        self.plan_file.write(&plan).await?;
        self.repo.commit_paths(&[self.plan_rel.as_str()], message).await?;
        Ok(())
    }

    /// Write the isolated-mode state snapshot (temp + rename).
    pub async fn save_snapshot(&self) -> Result<(), std::io::Error> {
        let plan = self.plan.read().await;
        let snapshot = IsolatedSnapshot {
            saved_at: self.clock.now(),
            items: plan
                .items
                .iter()
                .map(|i| SnapshotItem {
                    pr_id: i.id.clone(),
                    cold_state: i.cold_state,
                })
                .collect(),
        };
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.snapshot_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.snapshot_path.with_extension("tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.snapshot_path).await?;
        tracing::info!(path = %self.snapshot_path.display(), "isolated-state snapshot written");
        Ok(())
    }

    /// Repaint the plan file on `interval` until aborted.
    pub fn spawn_display_loop(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = sync.display_sync().await {
                    tracing::warn!(error = %err, "display sync failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_store_missing() {
        assert_eq!(
            classify(ColdState::Ready, None, None, None, false, false),
            Some(ConflictKind::StoreMissing)
        );
    }

    #[test]
    fn test_classify_divergence_trusts_repo() {
        assert_eq!(
            classify(
                ColdState::Completed,
                Some(ColdState::InProgress),
                None,
                None,
                false,
                false
            ),
            Some(ConflictKind::HotColdDivergence)
        );
    }

    #[test]
    fn test_classify_orphaned_hot_state() {
        // Hot state on a completed item.
        assert_eq!(
            classify(
                ColdState::Completed,
                Some(ColdState::Completed),
                Some(HotState::InProgress),
                Some("worker-agent-1"),
                true,
                false
            ),
            Some(ConflictKind::StoreOrphaned)
        );

        // Hot state with no agent attached.
        assert_eq!(
            classify(
                ColdState::InProgress,
                Some(ColdState::InProgress),
                Some(HotState::InProgress),
                None,
                false,
                false
            ),
            Some(ConflictKind::StoreOrphaned)
        );
    }

    #[test]
    fn test_classify_heartbeat_expired() {
        assert_eq!(
            classify(
                ColdState::InProgress,
                Some(ColdState::InProgress),
                Some(HotState::InProgress),
                Some("worker-agent-1"),
                false,
                false
            ),
            Some(ConflictKind::HeartbeatExpired)
        );
    }

    #[test]
    fn test_classify_concurrent_update_wins() {
        assert_eq!(
            classify(
                ColdState::InProgress,
                Some(ColdState::InProgress),
                Some(HotState::InProgress),
                Some("worker-agent-1"),
                true,
                true
            ),
            Some(ConflictKind::ConcurrentUpdate)
        );
    }

    #[test]
    fn test_classify_healthy_item_is_quiet() {
        assert_eq!(
            classify(
                ColdState::InProgress,
                Some(ColdState::InProgress),
                Some(HotState::InProgress),
                Some("worker-agent-1"),
                true,
                false
            ),
            None
        );
        assert_eq!(
            classify(ColdState::Ready, Some(ColdState::Ready), None, None, false, false),
            None
        );
    }
}
