//! Mergeflow: Hub
//!
//! The coordinator daemon. Owns the agent registry, the coordination
//! mode manager, hot/cold state synchronization, the agent spawner, and
//! the single-instance hub lifecycle.

pub mod config;
pub mod daemon;
pub mod error;
pub mod modes;
pub mod registry;
pub mod spawner;
pub mod status;
pub mod sync;

pub use config::HubConfig;
pub use daemon::{Hub, ShutdownOutcome};
pub use error::HubError;
pub use modes::{ModeDetector, ModeError, ModeManager};
pub use registry::{AgentRegistry, RegistryError};
pub use spawner::{AgentSpawner, SpawnedAgent, SpawnerConfig};
pub use status::HubStatus;
pub use sync::{ConflictKind, ConflictReport, StateSync};
