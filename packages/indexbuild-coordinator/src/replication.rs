//! Replication collaborator types
//!
//! - `ReplicationState`: this node's term and role, fed by leadership notifications
//! - `OplogEntry` / `CommittedLog`: the committed replicated log the applier consumes
//! - `InMemoryOplog`: a `CommittedLog` held in process

use async_trait::async_trait;
use indexbuild_storage::{KeySpec, LogPosition};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{CoordinatorError, Result};

/// Position of an entry in the replicated log
pub type OpTime = LogPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Leadership change reported by the consensus layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipEvent {
    pub term: u64,
    pub role: Role,
}

impl LeadershipEvent {
    pub fn step_up(term: u64) -> Self {
        Self {
            term,
            role: Role::Primary,
        }
    }

    pub fn step_down(term: u64) -> Self {
        Self {
            term,
            role: Role::Secondary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberState {
    pub term: u64,
    pub role: Role,
}

/// Result of applying a leadership event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipChange {
    /// Event carried an older term than already seen
    Stale,
    Unchanged,
    SteppedUp { term: u64 },
    /// Node was primary in `term` and no longer is
    SteppedDown { term: u64 },
}

/// Current term and role of this node
#[derive(Debug)]
pub struct ReplicationState {
    member: RwLock<MemberState>,
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new(0, Role::Secondary)
    }
}

impl ReplicationState {
    pub fn new(term: u64, role: Role) -> Self {
        Self {
            member: RwLock::new(MemberState { term, role }),
        }
    }

    pub fn current(&self) -> MemberState {
        *self.member.read()
    }

    pub fn is_primary(&self) -> bool {
        self.member.read().role == Role::Primary
    }

    pub fn term(&self) -> u64 {
        self.member.read().term
    }

    /// Record a leadership event; terms never go backwards
    pub fn apply(&self, event: LeadershipEvent) -> LeadershipChange {
        let mut member = self.member.write();
        if event.term < member.term {
            return LeadershipChange::Stale;
        }
        let previous = *member;
        *member = MemberState {
            term: event.term,
            role: event.role,
        };
        match (previous.role, event.role) {
            (Role::Primary, Role::Secondary) => LeadershipChange::SteppedDown {
                term: previous.term,
            },
            // A primary seeing a newer term lost its old leadership in between.
            (Role::Primary, Role::Primary) if event.term > previous.term => {
                LeadershipChange::SteppedDown {
                    term: previous.term,
                }
            }
            (Role::Secondary, Role::Primary) => LeadershipChange::SteppedUp { term: event.term },
            _ => LeadershipChange::Unchanged,
        }
    }
}

/// Operation carried by a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OplogOperation {
    CreateIndex { name: String, key_spec: KeySpec },
}

/// Committed replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_time: OpTime,
    pub namespace: String,
    #[serde(flatten)]
    pub operation: OplogOperation,
}

impl OplogEntry {
    pub fn create_index(
        op_time: OpTime,
        namespace: impl Into<String>,
        name: impl Into<String>,
        key_spec: KeySpec,
    ) -> Self {
        Self {
            op_time,
            namespace: namespace.into(),
            operation: OplogOperation::CreateIndex {
                name: name.into(),
                key_spec,
            },
        }
    }
}

/// Source of committed log entries
#[async_trait]
pub trait CommittedLog: Send + Sync {
    /// Entries strictly after `position`, in log order
    async fn entries_after(&self, position: Option<OpTime>) -> Result<Vec<OplogEntry>>;
}

/// Committed log held in memory; clones share the same entries
#[derive(Debug, Clone, Default)]
pub struct InMemoryOplog {
    entries: Arc<RwLock<Vec<OplogEntry>>>,
}

impl InMemoryOplog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; positions must strictly increase
    pub fn append(&self, entry: OplogEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(last) = entries.last() {
            if entry.op_time <= last.op_time {
                return Err(CoordinatorError::internal(format!(
                    "Out of order log entry {} after {}",
                    entry.op_time, last.op_time
                )));
            }
        }
        entries.push(entry);
        Ok(())
    }

    /// Append a create-index entry at the next index under `term`
    pub fn append_create_index(
        &self,
        term: u64,
        namespace: &str,
        name: &str,
        key_spec: KeySpec,
    ) -> Result<OpTime> {
        let next = self
            .entries
            .read()
            .last()
            .map_or(1, |e| e.op_time.index + 1);
        let op_time = OpTime::new(term, next);
        self.append(OplogEntry::create_index(op_time, namespace, name, key_spec))?;
        Ok(op_time)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CommittedLog for InMemoryOplog {
    async fn entries_after(&self, position: Option<OpTime>) -> Result<Vec<OplogEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|e| position.map_or(true, |p| e.op_time > p))
            .cloned()
            .collect())
    }
}
