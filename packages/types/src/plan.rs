//! Mergeflow: Plan
//!
//! An ordered sequence of work items plus planner metadata. The plan file
//! in the repository is the durable rendering of this structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::work_item::WorkItem;

/// Planner metadata carried alongside the items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    /// Sum of complexity scores across all items.
    pub total_complexity: u32,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            schema_version: 1,
            generated_at: None,
            total_complexity: 0,
        }
    }
}

/// The parsed plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub metadata: PlanMetadata,
    pub items: Vec<WorkItem>,
}

impl Plan {
    pub fn new(items: Vec<WorkItem>) -> Self {
        let mut plan = Self {
            metadata: PlanMetadata::default(),
            items,
        };
        plan.metadata.total_complexity = plan.aggregate_complexity();
        plan
    }

    pub fn aggregate_complexity(&self) -> u32 {
        self.items.iter().map(|i| u32::from(i.complexity.score)).sum()
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
