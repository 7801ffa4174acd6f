//! Typed facade over the coordination keyspace.
//!
//! Enforces the work-item state machine on every write. Multi-key
//! sequences (claim, release) are CAS-guarded with best-effort rollback;
//! anything the rollback misses is swept up by the next reconciliation
//! pass.

use chrono::{DateTime, Utc};

use mergeflow_types::{
    ColdState, Complexity, CoordinationMode, FileLease, HotState, ModeTransition, StoreHealth,
    Tier, UsageTotals, WorkItem,
};

use crate::client::KvClient;
use crate::error::StoreError;
use crate::keys;

/// TTL configuration for volatile keys.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    pub lease_ttl_secs: u64,
    pub heartbeat_ttl_secs: u64,
    pub history_limit: usize,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            heartbeat_ttl_secs: 300,
            history_limit: 100,
        }
    }
}

/// Typed operations on hot/cold work-item state, leases, heartbeats,
/// usage counters, and coordination records.
#[derive(Clone)]
pub struct StateStore {
    kv: KvClient,
    config: StateStoreConfig,
}

impl StateStore {
    pub fn new(kv: KvClient) -> Self {
        Self {
            kv,
            config: StateStoreConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StateStoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kv(&self) -> &KvClient {
        &self.kv
    }

    pub fn lease_ttl_secs(&self) -> u64 {
        self.config.lease_ttl_secs
    }

    // =========================================================================
    // Cold / hot state
    // =========================================================================

    pub async fn load_cold_state(&self, id: &str) -> Result<Option<ColdState>, StoreError> {
        let key = keys::pr_cold_state(id);
        match self.kv.get(&key).await? {
            Some(raw) => raw
                .parse::<ColdState>()
                .map(Some)
                .map_err(|e| StoreError::codec(&key, e)),
            None => Ok(None),
        }
    }

    /// Validated cold-state write. Unknown items are created in `to`;
    /// known items must pass the transition table. Re-asserting the
    /// current state is a no-op.
    pub async fn set_cold_state(&self, id: &str, to: ColdState) -> Result<(), StoreError> {
        let key = keys::pr_cold_state(id);
        match self.load_cold_state(id).await? {
            Some(current) if current == to => Ok(()),
            Some(current) => {
                if !current.can_transition(to) {
                    return Err(StoreError::InvariantViolation(
                        mergeflow_types::TransitionError::Illegal {
                            item: id.to_string(),
                            from: current,
                            to,
                        },
                    ));
                }
                self.kv
                    .cas(&key, Some(&current.to_string()), &to.to_string(), None)
                    .await
            }
            None => self.kv.cas(&key, None, &to.to_string(), None).await,
        }
    }

    pub async fn load_hot_state(&self, id: &str) -> Result<Option<HotState>, StoreError> {
        let key = keys::pr_hot_state(id);
        match self.kv.get(&key).await? {
            Some(raw) => raw
                .parse::<HotState>()
                .map(Some)
                .map_err(|e| StoreError::codec(&key, e)),
            None => Ok(None),
        }
    }

    /// Hot-state write; only the assigned agent may move it.
    pub async fn set_hot_state(
        &self,
        id: &str,
        agent_id: &str,
        hot: HotState,
    ) -> Result<(), StoreError> {
        let assigned = self.assigned_agent(id).await?;
        if assigned.as_deref() != Some(agent_id) {
            return Err(StoreError::Conflict {
                key: keys::pr_agent(id),
            });
        }
        self.kv
            .set(&keys::pr_hot_state(id), &hot.to_string())
            .await
    }

    pub async fn clear_hot_state(&self, id: &str) -> Result<(), StoreError> {
        self.kv.del(&keys::pr_hot_state(id)).await?;
        if let Some(agent) = self.assigned_agent(id).await? {
            self.kv.del(&keys::agent_current_pr(&agent)).await?;
        }
        self.kv.del(&keys::pr_agent(id)).await?;
        Ok(())
    }

    pub async fn assigned_agent(&self, id: &str) -> Result<Option<String>, StoreError> {
        self.kv.get(&keys::pr_agent(id)).await
    }

    /// Items (of `ids`) currently in `state`.
    pub async fn list_in_state(
        &self,
        ids: &[String],
        state: ColdState,
    ) -> Result<Vec<String>, StoreError> {
        let mut matched = Vec::new();
        for id in ids {
            if self.load_cold_state(id).await? == Some(state) {
                matched.push(id.clone());
            }
        }
        Ok(matched)
    }

    // =========================================================================
    // Claim / release
    // =========================================================================

    /// Atomically claim a schedulable item for an agent: cold `from` ->
    /// in_progress, hot = in_progress, agent recorded. Rolls back on any
    /// partial failure.
    pub async fn claim_work(
        &self,
        id: &str,
        agent_id: &str,
        from: ColdState,
    ) -> Result<(), StoreError> {
        if !from.is_schedulable() {
            return Err(StoreError::InvariantViolation(
                mergeflow_types::TransitionError::Illegal {
                    item: id.to_string(),
                    from,
                    to: ColdState::InProgress,
                },
            ));
        }

        let cold_key = keys::pr_cold_state(id);
        self.kv
            .cas(
                &cold_key,
                Some(&from.to_string()),
                &ColdState::InProgress.to_string(),
                None,
            )
            .await?;

        let claim = async {
            self.kv
                .set(&keys::pr_hot_state(id), &HotState::InProgress.to_string())
                .await?;
            self.kv.set(&keys::pr_agent(id), agent_id).await?;
            self.kv.set(&keys::agent_current_pr(agent_id), id).await?;
            Ok::<(), StoreError>(())
        };

        if let Err(err) = claim.await {
            tracing::warn!(pr_id = %id, agent_id = %agent_id, error = %err, "claim failed, rolling back");
            let _ = self.kv.del(&keys::pr_hot_state(id)).await;
            let _ = self.kv.del(&keys::pr_agent(id)).await;
            let _ = self.kv.del(&keys::agent_current_pr(agent_id)).await;
            let _ = self
                .kv
                .cas(
                    &cold_key,
                    Some(&ColdState::InProgress.to_string()),
                    &from.to_string(),
                    None,
                )
                .await;
            return Err(err);
        }
        Ok(())
    }

    /// Undo an assignment: hot state and agent binding are cleared and the
    /// item returns to `to` (ready, broken, or blocked).
    pub async fn release_work(&self, id: &str, to: ColdState) -> Result<(), StoreError> {
        self.clear_hot_state(id).await?;
        self.set_cold_state(id, to).await
    }

    // =========================================================================
    // Hydration
    // =========================================================================

    /// Write an item's durable attributes into the store, unconditionally.
    /// Used when the repository (source of truth) seeds or repairs the
    /// ephemeral view.
    pub async fn hydrate_item(&self, item: &WorkItem) -> Result<(), StoreError> {
        self.kv
            .set(&keys::pr_cold_state(&item.id), &item.cold_state.to_string())
            .await?;
        let deps = serde_json::to_string(&item.dependencies)
            .map_err(|e| StoreError::codec(keys::pr_dependencies(&item.id), e))?;
        self.kv.set(&keys::pr_dependencies(&item.id), &deps).await?;
        let complexity = serde_json::to_string(&item.complexity)
            .map_err(|e| StoreError::codec(keys::pr_complexity(&item.id), e))?;
        self.kv
            .set(&keys::pr_complexity(&item.id), &complexity)
            .await?;
        self.kv
            .set(
                &keys::pr_tier(&item.id),
                &serde_json::to_string(&item.complexity.suggested_tier)
                    .map_err(|e| StoreError::codec(keys::pr_tier(&item.id), e))?,
            )
            .await?;
        Ok(())
    }

    pub async fn load_complexity(&self, id: &str) -> Result<Option<Complexity>, StoreError> {
        let key = keys::pr_complexity(id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::codec(&key, e)),
            None => Ok(None),
        }
    }

    pub async fn load_tier(&self, id: &str) -> Result<Option<Tier>, StoreError> {
        let key = keys::pr_tier(id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::codec(&key, e)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Leases
    // =========================================================================

    /// Next fencing token for a path. Monotonic across lease lifetimes.
    pub async fn next_fence(&self, path: &str) -> Result<u64, StoreError> {
        let token = self.kv.incr(&keys::file_fence(path), 1).await?;
        Ok(token as u64)
    }

    /// Create the lease entry iff the path is free.
    pub async fn try_put_lease(&self, lease: &FileLease) -> Result<bool, StoreError> {
        let key = keys::file_lease(&lease.path);
        let json = serde_json::to_string(lease).map_err(|e| StoreError::codec(&key, e))?;
        self.kv
            .set_nx_ex(&key, &json, self.config.lease_ttl_secs)
            .await
    }

    pub async fn load_lease(&self, path: &str) -> Result<Option<FileLease>, StoreError> {
        let key = keys::file_lease(path);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::codec(&key, e)),
            None => Ok(None),
        }
    }

    /// Replace a lease record only if it still matches `previous`.
    pub async fn swap_lease(
        &self,
        previous: &FileLease,
        next: &FileLease,
    ) -> Result<(), StoreError> {
        let key = keys::file_lease(&previous.path);
        let old = serde_json::to_string(previous).map_err(|e| StoreError::codec(&key, e))?;
        let new = serde_json::to_string(next).map_err(|e| StoreError::codec(&key, e))?;
        self.kv
            .cas(&key, Some(&old), &new, Some(self.config.lease_ttl_secs))
            .await
    }

    /// Delete a lease only while it still matches `lease`.
    pub async fn remove_lease(&self, lease: &FileLease) -> Result<bool, StoreError> {
        let key = keys::file_lease(&lease.path);
        let json = serde_json::to_string(lease).map_err(|e| StoreError::codec(&key, e))?;
        self.kv.del_if_eq(&key, &json).await
    }

    /// Unconditional lease removal, for reclamation sweeps.
    pub async fn purge_lease(&self, path: &str) -> Result<bool, StoreError> {
        self.kv.del(&keys::file_lease(path)).await
    }

    /// Record which paths an item holds, for crash cleanup.
    pub async fn set_item_leases(&self, id: &str, paths: &[String]) -> Result<(), StoreError> {
        let key = keys::pr_leases(id);
        if paths.is_empty() {
            self.kv.del(&key).await?;
            return Ok(());
        }
        let json = serde_json::to_string(paths).map_err(|e| StoreError::codec(&key, e))?;
        self.kv.set(&key, &json).await
    }

    pub async fn item_leases(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let key = keys::pr_leases(id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::codec(&key, e)),
            None => Ok(Vec::new()),
        }
    }

    // =========================================================================
    // Heartbeats & usage
    // =========================================================================

    pub async fn renew_heartbeat(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.kv
            .set_ex(
                &keys::agent_heartbeat(agent_id),
                &now.to_rfc3339(),
                self.config.heartbeat_ttl_secs,
            )
            .await?;
        self.kv
            .zadd(
                keys::AGENT_HEARTBEAT_INDEX,
                agent_id,
                now.timestamp_millis() as f64,
            )
            .await
    }

    pub async fn load_heartbeat(&self, agent_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = keys::agent_heartbeat(agent_id);
        match self.kv.get(&key).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| StoreError::codec(&key, e)),
            None => Ok(None),
        }
    }

    pub async fn evict_heartbeat(&self, agent_id: &str) -> Result<(), StoreError> {
        self.kv.del(&keys::agent_heartbeat(agent_id)).await?;
        self.kv.zrem(keys::AGENT_HEARTBEAT_INDEX, agent_id).await
    }

    /// Accumulate token/cost usage against an item.
    pub async fn record_usage(
        &self,
        id: &str,
        tokens: u64,
        cost_usd: f64,
    ) -> Result<(), StoreError> {
        if tokens > 0 {
            self.kv
                .incr(&keys::pr_token_usage(id), tokens as i64)
                .await?;
        }
        if cost_usd > 0.0 {
            self.kv.incr_float(&keys::pr_cost(id), cost_usd).await?;
        }
        Ok(())
    }

    pub async fn usage(&self, id: &str) -> Result<UsageTotals, StoreError> {
        let tokens = self
            .kv
            .get(&keys::pr_token_usage(id))
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);
        let cost_usd = self
            .kv
            .get(&keys::pr_cost(id))
            .await?
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(UsageTotals { tokens, cost_usd })
    }

    // =========================================================================
    // Coordination records
    // =========================================================================

    pub async fn set_mode(&self, mode: CoordinationMode) -> Result<(), StoreError> {
        self.kv
            .set(keys::COORDINATION_MODE, &mode.to_string())
            .await
    }

    pub async fn load_mode(&self) -> Result<Option<CoordinationMode>, StoreError> {
        match self.kv.get(keys::COORDINATION_MODE).await? {
            Some(raw) => raw
                .parse::<CoordinationMode>()
                .map(Some)
                .map_err(|e| StoreError::codec(keys::COORDINATION_MODE, e)),
            None => Ok(None),
        }
    }

    pub async fn record_store_health(&self, health: StoreHealth) -> Result<(), StoreError> {
        let json = serde_json::to_string(&health)
            .map_err(|e| StoreError::codec(keys::COORDINATION_HEALTH, e))?;
        self.kv.set(keys::COORDINATION_HEALTH, &json).await
    }

    pub async fn push_history(&self, transition: &ModeTransition) -> Result<(), StoreError> {
        let json = serde_json::to_string(transition)
            .map_err(|e| StoreError::codec(keys::COORDINATION_HISTORY, e))?;
        self.kv
            .zadd(
                keys::COORDINATION_HISTORY,
                &json,
                transition.at.timestamp_millis() as f64,
            )
            .await
    }

    /// Newest-first transition history; undecodable entries are skipped.
    pub async fn history(&self, limit: usize) -> Result<Vec<ModeTransition>, StoreError> {
        let raw = self.kv.zrevrange(keys::COORDINATION_HISTORY, limit).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ttls() {
        let config = StateStoreConfig::default();
        assert_eq!(config.lease_ttl_secs, 300);
        assert_eq!(config.heartbeat_ttl_secs, 300);
    }
}
