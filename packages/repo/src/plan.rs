//! Plan file parsing and writing.
//!
//! The plan is UTF-8 text made of blocks separated by a line containing
//! only three hyphens. Only blocks beginning with `pr_id:` are work
//! items; every other block is operator commentary and passes through
//! unparsed. Unknown keys inside a block are ignored so newer planners
//! keep working against older hubs. Blocks that fail to parse are logged
//! and skipped, never fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mergeflow_types::{
    ColdState, Complexity, FileAction, HotState, Plan, PlanMetadata, PlannedFile, Priority, Tier,
    WorkItem,
};

use crate::error::RepoError;

/// Ephemeral per-item annotation written by display sync so operators can
/// see live progress in the plan file. Never read back into the model.
#[derive(Debug, Clone, PartialEq)]
pub struct HotAnnotation {
    pub hot_state: HotState,
    pub agent: String,
}

/// Handle on the plan file.
#[derive(Debug, Clone)]
pub struct PlanFile {
    path: PathBuf,
}

/// One `pr_id:` block as it appears on disk.
#[derive(Debug, Serialize, Deserialize)]
struct ItemDoc {
    pr_id: String,
    #[serde(default)]
    title: String,
    cold_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    complexity: Option<ComplexityDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    estimated_files: Vec<FileDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    actual_files: Vec<FileDoc>,
    // Display-only annotations; parsed but not modeled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hot_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ComplexityDoc {
    #[serde(default = "default_score")]
    score: u8,
    #[serde(default = "default_minutes")]
    estimated_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    suggested_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rationale: Option<String>,
}

fn default_score() -> u8 {
    1
}

fn default_minutes() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize)]
struct FileDoc {
    path: String,
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl PlanFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the plan file. A missing file is an empty plan.
    pub async fn load(&self) -> Result<Plan, RepoError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no plan file, starting empty");
                return Ok(Plan::default());
            }
            Err(err) => return Err(RepoError::io(self.path.display().to_string(), err)),
        };
        let text = String::from_utf8(raw).map_err(|e| RepoError::Encoding(e.to_string()))?;
        Ok(parse_plan(&text))
    }

    /// Write the plan atomically (temp + rename), without annotations.
    pub async fn write(&self, plan: &Plan) -> Result<(), RepoError> {
        self.write_annotated(plan, &HashMap::new()).await
    }

    /// Write the plan atomically, folding in live hot-state annotations.
    pub async fn write_annotated(
        &self,
        plan: &Plan,
        annotations: &HashMap<String, HotAnnotation>,
    ) -> Result<(), RepoError> {
        let text = render_plan(plan, annotations);
        let tmp = self.path.with_extension(format!(
            "tmp-{}",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, text.as_bytes())
            .await
            .map_err(|e| RepoError::io(tmp.display().to_string(), e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| RepoError::io(self.path.display().to_string(), e))?;
        Ok(())
    }
}

/// Parse plan text into a `Plan`. Never fails: bad blocks are skipped.
pub fn parse_plan(text: &str) -> Plan {
    let normalized = text.replace("\r\n", "\n");
    let mut items = Vec::new();

    for block in normalized.split("\n---\n") {
        let trimmed = block.trim();
        if trimmed.is_empty() || !trimmed.starts_with("pr_id:") {
            continue;
        }
        match serde_yml::from_str::<ItemDoc>(trimmed) {
            Ok(doc) => match item_from_doc(doc) {
                Ok(item) => items.push(item),
                Err(reason) => {
                    tracing::warn!(%reason, "skipping unparseable plan block");
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "skipping unparseable plan block");
            }
        }
    }

    let mut plan = Plan::new(items);
    plan.metadata = PlanMetadata {
        schema_version: 1,
        generated_at: None,
        total_complexity: plan.aggregate_complexity(),
    };
    plan
}

fn item_from_doc(doc: ItemDoc) -> Result<WorkItem, String> {
    let cold_state: ColdState = doc
        .cold_state
        .parse()
        .map_err(|e| format!("{}: {e}", doc.pr_id))?;
    let priority = match doc.priority.as_deref() {
        Some(p) => p.parse::<Priority>().map_err(|e| format!("{}: {e}", doc.pr_id))?,
        None => Priority::default(),
    };
    let complexity = match doc.complexity {
        Some(c) => Complexity {
            score: c.score.clamp(1, 10),
            estimated_minutes: c.estimated_minutes,
            suggested_tier: match c.suggested_model.as_deref() {
                Some(t) => t.parse::<Tier>().unwrap_or_default(),
                None => Tier::default(),
            },
            rationale: c.rationale,
        },
        None => Complexity::default(),
    };

    Ok(WorkItem {
        id: doc.pr_id,
        title: doc.title,
        cold_state,
        priority,
        complexity,
        dependencies: doc.dependencies,
        estimated_files: files_from_docs(doc.estimated_files)?,
        actual_files: files_from_docs(doc.actual_files)?,
    })
}

fn files_from_docs(docs: Vec<FileDoc>) -> Result<Vec<PlannedFile>, String> {
    docs.into_iter()
        .map(|f| {
            let action: FileAction = f.action.parse().map_err(|e| format!("{}: {e}", f.path))?;
            Ok(PlannedFile {
                path: f.path,
                action,
                description: f.description,
            })
        })
        .collect()
}

fn doc_from_item(item: &WorkItem, annotation: Option<&HotAnnotation>) -> ItemDoc {
    ItemDoc {
        pr_id: item.id.clone(),
        title: item.title.clone(),
        cold_state: item.cold_state.to_string(),
        priority: Some(format!("{:?}", item.priority).to_lowercase()),
        complexity: Some(ComplexityDoc {
            score: item.complexity.score,
            estimated_minutes: item.complexity.estimated_minutes,
            suggested_model: Some(
                serde_json::to_value(item.complexity.suggested_tier)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "low".to_string()),
            ),
            rationale: item.complexity.rationale.clone(),
        }),
        dependencies: item.dependencies.clone(),
        estimated_files: item.estimated_files.iter().map(file_to_doc).collect(),
        actual_files: item.actual_files.iter().map(file_to_doc).collect(),
        hot_state: annotation.map(|a| a.hot_state.to_string()),
        agent: annotation.map(|a| a.agent.clone()),
    }
}

fn file_to_doc(file: &PlannedFile) -> FileDoc {
    FileDoc {
        path: file.path.clone(),
        action: file.action.to_string(),
        description: file.description.clone(),
    }
}

/// Render a plan as block-delimited text.
pub fn render_plan(plan: &Plan, annotations: &HashMap<String, HotAnnotation>) -> String {
    let mut blocks = Vec::with_capacity(plan.items.len() + 1);
    blocks.push(format!(
        "# mergeflow plan (schema v{}, total complexity {})",
        plan.metadata.schema_version,
        plan.aggregate_complexity()
    ));

    for item in &plan.items {
        let doc = doc_from_item(item, annotations.get(&item.id));
        match serde_yml::to_string(&doc) {
            Ok(rendered) => blocks.push(rendered.trim_end().to_string()),
            Err(err) => {
                tracing::error!(pr_id = %item.id, error = %err, "failed to render plan block");
            }
        }
    }

    let mut out = blocks.join("\n---\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# plan header
---
pr_id: PR-001
title: Add parser
cold_state: ready
priority: high
complexity:
  score: 4
  estimated_minutes: 45
  suggested_model: mid
  rationale: touches the tokenizer
dependencies:
  - PR-000
estimated_files:
  - path: src/parse.rs
    action: modify
    description: new grammar rule
---
pr_id: PR-002
title: Docs
cold_state: new
---
not_a_pr: true
stray: data
";

    #[test]
    fn test_parse_sample() {
        let plan = parse_plan(SAMPLE);
        assert_eq!(plan.len(), 2);

        let a = plan.get("PR-001").unwrap();
        assert_eq!(a.cold_state, ColdState::Ready);
        assert_eq!(a.priority, Priority::High);
        assert_eq!(a.complexity.score, 4);
        assert_eq!(a.complexity.suggested_tier, Tier::Mid);
        assert_eq!(a.dependencies, vec!["PR-000".to_string()]);
        assert_eq!(a.estimated_files[0].path, "src/parse.rs");

        // Missing complexity falls back to the defaults.
        let b = plan.get("PR-002").unwrap();
        assert_eq!(b.complexity.score, 1);
        assert_eq!(b.complexity.estimated_minutes, 10);
        assert_eq!(b.complexity.suggested_tier, Tier::Low);
    }

    #[test]
    fn test_parse_normalizes_crlf() {
        let crlf = SAMPLE.replace('\n', "\r\n");
        let plan = parse_plan(&crlf);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let text = "\
pr_id: PR-009
cold_state: new
shiny_future_field: 42
another:
  nested: thing
";
        let plan = parse_plan(text);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_bad_block_is_skipped() {
        let text = "\
pr_id: PR-001
cold_state: ready
---
pr_id: PR-002
cold_state: not_a_state
---
pr_id: PR-003
cold_state: new
";
        let plan = parse_plan(text);
        assert_eq!(plan.len(), 2);
        assert!(plan.get("PR-002").is_none());
    }

    #[test]
    fn test_round_trip_preserves_documented_keys() {
        let plan = parse_plan(SAMPLE);
        let rendered = render_plan(&plan, &HashMap::new());
        let reparsed = parse_plan(&rendered);
        assert_eq!(reparsed.items, plan.items);
    }

    #[test]
    fn test_annotations_render_and_do_not_leak() {
        let plan = parse_plan(SAMPLE);
        let annotations = HashMap::from([(
            "PR-001".to_string(),
            HotAnnotation {
                hot_state: HotState::InProgress,
                agent: "worker-agent-1".to_string(),
            },
        )]);
        let rendered = render_plan(&plan, &annotations);
        assert!(rendered.contains("hot_state: in_progress"));
        assert!(rendered.contains("agent: worker-agent-1"));

        // Annotations are display-only; reparsing yields the same model.
        let reparsed = parse_plan(&rendered);
        assert_eq!(reparsed.items, plan.items);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        let file = PlanFile::new(dir.path().join("plan.md"));
        let plan = file.load().await.unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = PlanFile::new(dir.path().join("plan.md"));
        let plan = parse_plan(SAMPLE);

        file.write(&plan).await.unwrap();
        let loaded = file.load().await.unwrap();
        assert_eq!(loaded.items, plan.items);

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
