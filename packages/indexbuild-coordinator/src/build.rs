use crate::error::{CoordinatorError, Result};
use crate::replication::OpTime;
use chrono::{DateTime, Utc};
use indexbuild_storage::{IndexDescriptor, KeySpec};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Build identifier, assigned at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build state
///
/// ```text
/// Initializing ──► Scanning ──► Committed
///      │  │           │
///      │  └──► Aborting ◄┘
///      │           │
///      └──────► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Initializing,
    Scanning,
    Aborting,
    Aborted,
    Committed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Initializing => "initializing",
            BuildState::Scanning => "scanning",
            BuildState::Aborting => "aborting",
            BuildState::Aborted => "aborted",
            BuildState::Committed => "committed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Aborted | BuildState::Committed)
    }

    /// Whether the build is still doing work that an interrupt can stop
    pub fn is_running(&self) -> bool {
        matches!(self, BuildState::Initializing | BuildState::Scanning)
    }

    pub fn can_transition_to(&self, next: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, next),
            (Initializing, Scanning)
                | (Initializing, Aborting)
                | (Initializing, Aborted)
                | (Scanning, Aborting)
                | (Scanning, Committed)
                | (Aborting, Aborted)
        )
    }
}

impl std::str::FromStr for BuildState {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initializing" => Ok(BuildState::Initializing),
            "scanning" => Ok(BuildState::Scanning),
            "aborting" => Ok(BuildState::Aborting),
            "aborted" => Ok(BuildState::Aborted),
            "committed" => Ok(BuildState::Committed),
            _ => Err(CoordinatorError::internal(format!(
                "Invalid build state: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a build request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildOrigin {
    /// Local create-index command on the primary
    Local,
    /// Committed log entry applied by the replication applier
    Replicated { op_time: OpTime },
}

/// Registry entry for one index build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBuildEntry {
    pub build_id: BuildId,
    pub namespace: String,
    pub index_name: String,
    pub key_spec: KeySpec,
    pub state: BuildState,
    /// Leadership term under which the build was started
    pub origin_term: u64,
    pub origin: BuildOrigin,
    /// Set once the build passed its commit fence; abort requests are refused after that
    pub committing: bool,
    /// Why an abort was requested, once it was
    pub abort_reason: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexBuildEntry {
    pub fn new(
        namespace: String,
        index_name: String,
        key_spec: KeySpec,
        origin_term: u64,
        origin: BuildOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            build_id: BuildId::new(),
            namespace,
            index_name,
            key_spec,
            state: BuildState::Initializing,
            origin_term,
            origin,
            committing: false,
            abort_reason: None,
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn descriptor(&self) -> IndexDescriptor {
        IndexDescriptor::new(
            self.namespace.clone(),
            self.index_name.clone(),
            self.key_spec.clone(),
        )
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: BuildState) -> Result<BuildState> {
        if !self.state.can_transition_to(next) {
            return Err(CoordinatorError::InvalidTransition {
                build_id: self.build_id,
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.updated_at = Utc::now();
        Ok(previous)
    }
}
