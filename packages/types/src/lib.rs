//! Mergeflow: Core Types
//!
//! Shared data model for the coordination plane: work items and their
//! hot/cold state machines, agents, file leases, bus messages, plans,
//! and coordination-mode records.

pub mod agent;
pub mod clock;
pub mod coordination;
pub mod lease;
pub mod message;
pub mod plan;
pub mod work_item;

pub use agent::{AgentInfo, AgentStatus, AgentType, Capabilities};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordination::{
    CoordinationMode, ModeTransition, StoreHealth, TransitionRing,
};
pub use lease::FileLease;
pub use message::{Envelope, MessagePriority, Payload};
pub use plan::{Plan, PlanMetadata};
pub use work_item::{
    ColdState, Complexity, FileAction, HotState, PlannedFile, Priority, Tier,
    TransitionError, UsageTotals, WorkItem,
};
