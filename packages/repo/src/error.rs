//! Repo interface errors.

/// Repository operation errors.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {op} failed: {detail}")]
    Git { op: String, detail: String },

    #[error("plan file is not valid UTF-8: {0}")]
    Encoding(String),
}

impl RepoError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        RepoError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn git(op: impl Into<String>, detail: impl Into<String>) -> Self {
        RepoError::Git {
            op: op.into(),
            detail: detail.into(),
        }
    }
}
