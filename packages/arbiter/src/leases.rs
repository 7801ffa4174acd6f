//! Lease manager.
//!
//! Exclusive per-path leases with TTL, renewable by heartbeat. Multi-path
//! acquisition is all-or-nothing: paths are taken in canonical (sorted)
//! order and every acquired entry is rolled back on the first collision.
//! A pairing table expands each request so a source file and its test
//! file are always leased together.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use mergeflow_store::{StateStore, StoreError};
use mergeflow_types::FileLease;

/// Explicit `{source -> test}` pairing. No inference: only paths listed
/// here are expanded.
pub type PairingTable = HashMap<String, String>;

/// Lease operation errors.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("{} path(s) already leased", conflicts.len())]
    Taken {
        /// (path, holder) for each conflicting entry.
        conflicts: Vec<(String, String)>,
    },

    #[error("lease on {path} not held by {requester} (holder: {holder})")]
    Unauthorized {
        path: String,
        holder: String,
        requester: String,
    },

    #[error(transparent)]
    Unavailable(#[from] StoreError),
}

/// Per-file exclusive leasing over the shared store.
#[derive(Clone)]
pub struct LeaseManager {
    store: StateStore,
    pairings: Arc<HashMap<String, String>>,
    reverse_pairings: Arc<HashMap<String, String>>,
}

impl LeaseManager {
    pub fn new(store: StateStore, pairings: PairingTable) -> Self {
        let reverse = pairings
            .iter()
            .map(|(src, test)| (test.clone(), src.clone()))
            .collect();
        Self {
            store,
            pairings: Arc::new(pairings),
            reverse_pairings: Arc::new(reverse),
        }
    }

    /// Expand a path set with its pairs, in canonical order. Acquiring
    /// either side of a pair always pulls in the other.
    pub fn expand(&self, paths: &[String]) -> Vec<String> {
        expand_paths(&self.pairings, &self.reverse_pairings, paths)
    }

    /// Acquire every path (pair-expanded) or none. Returns the leases,
    /// each carrying its fencing token.
    pub async fn acquire(
        &self,
        agent_id: &str,
        paths: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<FileLease>, LeaseError> {
        let expanded = self.expand(paths);
        let ttl = chrono::Duration::seconds(self.store.lease_ttl_secs() as i64);

        // Pre-scan so the caller learns every conflicting holder at once.
        let mut conflicts = Vec::new();
        for path in &expanded {
            if let Some(existing) = self.store.load_lease(path).await? {
                if !existing.is_expired(now) && existing.holder != agent_id {
                    conflicts.push((path.clone(), existing.holder));
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(LeaseError::Taken { conflicts });
        }

        let mut acquired: Vec<FileLease> = Vec::with_capacity(expanded.len());
        for path in &expanded {
            match self.acquire_one(agent_id, path, now, ttl).await {
                Ok(lease) => acquired.push(lease),
                Err(err) => {
                    // Lost a race after the pre-scan: undo everything.
                    for lease in &acquired {
                        if let Err(undo_err) = self.store.remove_lease(lease).await {
                            tracing::warn!(
                                path = %lease.path,
                                error = %undo_err,
                                "rollback failed; lease will lapse by TTL"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }

        tracing::debug!(agent_id = %agent_id, count = acquired.len(), "leases acquired");
        Ok(acquired)
    }

    async fn acquire_one(
        &self,
        agent_id: &str,
        path: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<FileLease, LeaseError> {
        // Clear an expired entry first so the NX create can win.
        if let Some(existing) = self.store.load_lease(path).await? {
            if existing.is_expired(now) {
                self.store.remove_lease(&existing).await?;
            } else if existing.holder == agent_id {
                // Re-acquisition by the holder refreshes the expiry and
                // keeps the original fencing token.
                let mut renewed = existing.clone();
                renewed.renew(now, ttl);
                return match self.store.swap_lease(&existing, &renewed).await {
                    Ok(()) => Ok(renewed),
                    Err(StoreError::Conflict { .. }) => Err(LeaseError::Taken {
                        conflicts: vec![(path.to_string(), existing.holder)],
                    }),
                    Err(err) => Err(err.into()),
                };
            }
        }

        let token = self.store.next_fence(path).await?;
        let lease = FileLease::new(path, agent_id, token, now, ttl);
        if self.store.try_put_lease(&lease).await? {
            Ok(lease)
        } else {
            let holder = self
                .store
                .load_lease(path)
                .await?
                .map(|l| l.holder)
                .unwrap_or_else(|| "unknown".to_string());
            Err(LeaseError::Taken {
                conflicts: vec![(path.to_string(), holder)],
            })
        }
    }

    /// Bump expiry on every held path. Paths the agent does not hold
    /// fail with `Unauthorized`.
    pub async fn renew(
        &self,
        agent_id: &str,
        paths: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let ttl = chrono::Duration::seconds(self.store.lease_ttl_secs() as i64);
        for path in self.expand(paths) {
            let existing = self.store.load_lease(&path).await?;
            match existing {
                Some(lease) if lease.holder == agent_id => {
                    let mut renewed = lease.clone();
                    renewed.renew(now, ttl);
                    self.store.swap_lease(&lease, &renewed).await?;
                }
                Some(lease) => {
                    return Err(LeaseError::Unauthorized {
                        path,
                        holder: lease.holder,
                        requester: agent_id.to_string(),
                    });
                }
                None => {
                    return Err(LeaseError::Unauthorized {
                        path,
                        holder: "none".to_string(),
                        requester: agent_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Release the entries the agent holds. Attempting to release someone
    /// else's lease fails, but entries owned by the caller are still
    /// removed first.
    pub async fn release(&self, agent_id: &str, paths: &[String]) -> Result<(), LeaseError> {
        let mut unauthorized: Option<LeaseError> = None;
        for path in self.expand(paths) {
            match self.store.load_lease(&path).await? {
                Some(lease) if lease.holder == agent_id => {
                    self.store.remove_lease(&lease).await?;
                }
                Some(lease) => {
                    unauthorized.get_or_insert(LeaseError::Unauthorized {
                        path,
                        holder: lease.holder,
                        requester: agent_id.to_string(),
                    });
                }
                None => {}
            }
        }
        match unauthorized {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop every lease held by `agent_id` among `paths`, regardless of
    /// expiry. Crash-reclamation path; only the hub calls this.
    pub async fn reclaim_holder(
        &self,
        agent_id: &str,
        paths: &[String],
    ) -> Result<usize, LeaseError> {
        let mut reclaimed = 0;
        for path in self.expand(paths) {
            if let Some(lease) = self.store.load_lease(&path).await? {
                if lease.holder == agent_id && self.store.remove_lease(&lease).await? {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            tracing::info!(agent_id = %agent_id, count = reclaimed, "reclaimed leases from holder");
        }
        Ok(reclaimed)
    }

    /// Remove leases whose TTL has lapsed. Returns the freed paths.
    pub async fn sweep_expired(
        &self,
        paths: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, LeaseError> {
        let mut freed = Vec::new();
        for path in paths {
            if let Some(lease) = self.store.load_lease(path).await? {
                if lease.is_expired(now) && self.store.remove_lease(&lease).await? {
                    freed.push(path.clone());
                }
            }
        }
        Ok(freed)
    }
}

fn expand_paths(
    pairings: &HashMap<String, String>,
    reverse: &HashMap<String, String>,
    paths: &[String],
) -> Vec<String> {
    let mut expanded: BTreeSet<String> = BTreeSet::new();
    for path in paths {
        expanded.insert(path.clone());
        if let Some(test) = pairings.get(path) {
            expanded.insert(test.clone());
        }
        if let Some(source) = reverse.get(path) {
            expanded.insert(source.clone());
        }
    }
    expanded.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (HashMap<String, String>, HashMap<String, String>) {
        let pairings = HashMap::from([(
            "src/parse.rs".to_string(),
            "tests/parse.rs".to_string(),
        )]);
        let reverse = pairings
            .iter()
            .map(|(s, t)| (t.clone(), s.clone()))
            .collect();
        (pairings, reverse)
    }

    fn owned(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| (*p).to_string()).collect()
    }

    #[test]
    fn test_expansion_is_sorted_and_paired() {
        let (pairings, reverse) = table();

        let expanded = expand_paths(&pairings, &reverse, &owned(&["src/parse.rs", "src/a.rs"]));
        assert_eq!(
            expanded,
            vec![
                "src/a.rs".to_string(),
                "src/parse.rs".to_string(),
                "tests/parse.rs".to_string(),
            ]
        );

        // Asking for the test side pulls in the source side too.
        let expanded = expand_paths(&pairings, &reverse, &owned(&["tests/parse.rs"]));
        assert_eq!(
            expanded,
            vec!["src/parse.rs".to_string(), "tests/parse.rs".to_string()]
        );
    }

    #[test]
    fn test_expansion_dedups() {
        let empty = HashMap::new();
        let expanded = expand_paths(&empty, &empty, &owned(&["b.rs", "a.rs", "b.rs"]));
        assert_eq!(expanded, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }

    #[test]
    fn test_taken_error_reports_holders() {
        let err = LeaseError::Taken {
            conflicts: vec![
                ("src/a.rs".to_string(), "worker-agent-2".to_string()),
                ("src/b.rs".to_string(), "worker-agent-3".to_string()),
            ],
        };
        assert_eq!(err.to_string(), "2 path(s) already leased");
    }
}
