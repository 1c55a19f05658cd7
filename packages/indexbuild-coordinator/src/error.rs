use crate::build::{BuildId, BuildState};
use indexbuild_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Index build conflict: {index_name} on {namespace} already has live build {existing}")]
    NameConflict {
        namespace: String,
        index_name: String,
        existing: BuildId,
    },

    #[error("Invalid state transition for build {build_id}: {from} -> {to}")]
    InvalidTransition {
        build_id: BuildId,
        from: BuildState,
        to: BuildState,
    },

    #[error("Build not found: {0}")]
    BuildNotFound(BuildId),

    #[error("Cannot retire build {build_id} while {state}")]
    RetireLiveBuild { build_id: BuildId, state: BuildState },

    #[error("Index already exists: {index_name} on {namespace}")]
    IndexAlreadyExists {
        namespace: String,
        index_name: String,
    },

    #[error("Index build aborted: {index_name} on {namespace}: {reason}")]
    BuildAbortedByInterrupt {
        namespace: String,
        index_name: String,
        reason: String,
    },

    #[error("Not primary: cannot start index build {index_name} on {namespace}")]
    NotPrimary {
        namespace: String,
        index_name: String,
    },

    #[error(
        "Index build conflict: {index_name} on {namespace} (build {existing} still {state}) \
         unresolved after {waited_ms}ms"
    )]
    ReplicationConflictUnresolved {
        namespace: String,
        index_name: String,
        existing: BuildId,
        state: BuildState,
        waited_ms: u64,
    },

    #[error("Catalog divergence: {index_name} on {namespace} is published as {published}, log says {replicated}")]
    CatalogDivergence {
        namespace: String,
        index_name: String,
        published: String,
        replicated: String,
    },

    #[error("Replicated index build {index_name} on {namespace} failed: {reason}")]
    ReplicatedBuildFailed {
        namespace: String,
        index_name: String,
        reason: String,
    },

    #[error("Replication apply path halted: {0}")]
    Halted(String),

    #[error("Node terminated before build {0} finished")]
    Terminated(BuildId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CoordinatorError::BuildAbortedByInterrupt { .. } => ErrorCategory::Interrupted,
            CoordinatorError::ReplicationConflictUnresolved { .. }
            | CoordinatorError::CatalogDivergence { .. }
            | CoordinatorError::ReplicatedBuildFailed { .. }
            | CoordinatorError::Halted(_) => ErrorCategory::Fatal,
            _ => ErrorCategory::Recoverable,
        }
    }

    /// Fatal errors must never be recovered in-process; they halt the apply path.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }
}

/// How an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Rejected call, no state change (e.g., name conflict, invalid transition)
    Recoverable,
    /// Expected abort surfaced to the build's requester
    Interrupted,
    /// Unrecoverable consistency hazard - the node must halt and restart
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Recoverable => "recoverable",
            ErrorCategory::Interrupted => "interrupted",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recoverable" => Ok(ErrorCategory::Recoverable),
            "interrupted" => Ok(ErrorCategory::Interrupted),
            "fatal" => Ok(ErrorCategory::Fatal),
            _ => Err(CoordinatorError::internal(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
