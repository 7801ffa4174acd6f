//! Hub errors and process exit codes.

use mergeflow_arbiter::LeaseError;
use mergeflow_bus::BusError;
use mergeflow_repo::RepoError;
use mergeflow_store::StoreError;

/// Hub lifecycle and coordination errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("another hub is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("failed to spawn {agent_type} agent: {reason}")]
    SpawnFailed { agent_type: String, reason: String },

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl HubError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        HubError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code: 0 clean, 1 fatal startup, 2 shutdown timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            HubError::ShutdownTimeout => 2,
            _ => 1,
        }
    }
}
