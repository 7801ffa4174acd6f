//! Mergeflow: Repo Interface
//!
//! The repository is the durable source of truth: the plan file carries
//! cold state, and git branches carry degraded-mode work. Everything in
//! here is the only code that touches the working tree on the hub's
//! behalf.

pub mod error;
pub mod git;
pub mod plan;

pub use error::RepoError;
pub use git::{GitRepo, MergeOutcome};
pub use plan::{HotAnnotation, PlanFile};
