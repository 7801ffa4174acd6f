//! Mergeflow: Coordination Modes
//!
//! Three operating configurations, ordered by how much of the shared
//! coordination store is reachable. Transitions only move between
//! adjacent modes; a two-step change goes via the intermediate mode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Operating configuration of the coordination plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationMode {
    /// Shared store reachable and healthy: full leases, central scheduling.
    Distributed,
    /// Shared store unreachable, local instance usable: per-agent branches.
    Degraded,
    /// No store at all: advisory file leases, file-based bus.
    Isolated,
}

impl CoordinationMode {
    /// One step towards less coordination, if any.
    pub fn downgraded(self) -> Option<CoordinationMode> {
        match self {
            CoordinationMode::Distributed => Some(CoordinationMode::Degraded),
            CoordinationMode::Degraded => Some(CoordinationMode::Isolated),
            CoordinationMode::Isolated => None,
        }
    }

    /// One step towards more coordination, if any.
    pub fn upgraded(self) -> Option<CoordinationMode> {
        match self {
            CoordinationMode::Distributed => None,
            CoordinationMode::Degraded => Some(CoordinationMode::Distributed),
            CoordinationMode::Isolated => Some(CoordinationMode::Degraded),
        }
    }

    pub fn is_adjacent(self, other: CoordinationMode) -> bool {
        self.downgraded() == Some(other) || self.upgraded() == Some(other)
    }
}

impl fmt::Display for CoordinationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinationMode::Distributed => "distributed",
            CoordinationMode::Degraded => "degraded",
            CoordinationMode::Isolated => "isolated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CoordinationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "distributed" => Ok(CoordinationMode::Distributed),
            "degraded" => Ok(CoordinationMode::Degraded),
            "isolated" => Ok(CoordinationMode::Isolated),
            other => Err(format!("unknown coordination mode '{other}'")),
        }
    }
}

/// One recorded mode change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: CoordinationMode,
    pub to: CoordinationMode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Bounded in-memory transition history.
#[derive(Debug, Clone)]
pub struct TransitionRing {
    entries: VecDeque<ModeTransition>,
    capacity: usize,
}

impl TransitionRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, transition: ModeTransition) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(transition);
    }

    pub fn last(&self) -> Option<&ModeTransition> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModeTransition> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TransitionRing {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Latest probe result for the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl StoreHealth {
    pub fn healthy(checked_at: DateTime<Utc>, latency_ms: u64) -> Self {
        Self {
            healthy: true,
            checked_at,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn unhealthy(checked_at: DateTime<Utc>) -> Self {
        Self {
            healthy: false,
            checked_at,
            latency_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_adjacency() {
        assert!(CoordinationMode::Distributed.is_adjacent(CoordinationMode::Degraded));
        assert!(CoordinationMode::Degraded.is_adjacent(CoordinationMode::Isolated));
        assert!(!CoordinationMode::Distributed.is_adjacent(CoordinationMode::Isolated));
        assert_eq!(CoordinationMode::Isolated.downgraded(), None);
        assert_eq!(CoordinationMode::Distributed.upgraded(), None);
    }

    #[test]
    fn test_transition_ring_is_bounded() {
        let mut ring = TransitionRing::new(2);
        for i in 0..3 {
            ring.push(ModeTransition {
                from: CoordinationMode::Distributed,
                to: CoordinationMode::Degraded,
                reason: format!("probe failure #{i}"),
                at: Utc::now(),
            });
        }
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.last().unwrap().reason, "probe failure #2");
    }
}
