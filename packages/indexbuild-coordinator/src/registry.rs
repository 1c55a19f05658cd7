//! Build Registry
//!
//! Tracks every non-retired index build, keyed by namespace and index name.
//!
//! # Invariants
//!
//! - At most one non-retired entry per `(namespace, index_name)`
//! - Every mutation for a namespace happens under that namespace's lock, so a
//!   lookup followed by a decision in the same closure sees a consistent view
//! - State changes are broadcast as `BuildEvent`s in the order they happen
//!
//! # Concurrency
//!
//! ```text
//! DashMap<namespace, Arc<Mutex<NamespaceBuilds>>>
//!            │
//!            └─ one lock per namespace; different namespaces never contend
//! ```
//!
//! A shard is dropped from the map when its last build retires, so the map
//! only holds namespaces with live builds. A dropped shard is marked
//! detached under its lock; registration that raced onto it starts over.

use crate::build::{BuildId, BuildOrigin, BuildState, IndexBuildEntry};
use crate::error::{CoordinatorError, Result};
use crate::events::BuildEvent;
use dashmap::DashMap;
use indexbuild_storage::KeySpec;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Slot {
    entry: IndexBuildEntry,
    cancel: CancellationToken,
}

#[derive(Default)]
struct NamespaceBuilds {
    slots: HashMap<BuildId, Slot>,
    /// No longer reachable from the map
    detached: bool,
}

impl NamespaceBuilds {
    fn by_name(&self, index_name: &str) -> Option<&Slot> {
        self.slots
            .values()
            .find(|slot| slot.entry.index_name == index_name)
    }
}

/// Outcome of `request_abort`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRequest {
    /// Build moved to `Aborting`; its task will roll back at the next checkpoint
    Requested,
    AlreadyAborting,
    /// Build passed its commit fence and will finish
    Committing,
    /// Build already reached a terminal state
    Finished,
}

pub struct BuildRegistry {
    namespaces: DashMap<String, Arc<Mutex<NamespaceBuilds>>>,
    locations: DashMap<BuildId, String>,
    events: broadcast::Sender<BuildEvent>,
}

impl BuildRegistry {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            namespaces: DashMap::new(),
            locations: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    /// Create an `Initializing` entry for a new build
    ///
    /// # Errors
    ///
    /// `NameConflict` if a non-retired entry already uses the name; nothing is
    /// created in that case.
    pub fn register(
        &self,
        namespace: &str,
        index_name: &str,
        key_spec: KeySpec,
        origin_term: u64,
        origin: BuildOrigin,
    ) -> Result<BuildId> {
        loop {
            let shard = self.namespace(namespace);
            let mut builds = shard.lock();
            if builds.detached {
                continue;
            }
            return self.insert(&mut builds, namespace, index_name, key_spec, origin_term, origin);
        }
    }

    fn insert(
        &self,
        builds: &mut NamespaceBuilds,
        namespace: &str,
        index_name: &str,
        key_spec: KeySpec,
        origin_term: u64,
        origin: BuildOrigin,
    ) -> Result<BuildId> {
        if let Some(existing) = builds.by_name(index_name) {
            return Err(CoordinatorError::NameConflict {
                namespace: namespace.to_string(),
                index_name: index_name.to_string(),
                existing: existing.entry.build_id,
            });
        }

        let entry = IndexBuildEntry::new(
            namespace.to_string(),
            index_name.to_string(),
            key_spec,
            origin_term,
            origin,
        );
        let build_id = entry.build_id;
        self.locations.insert(build_id, namespace.to_string());
        builds.slots.insert(
            build_id,
            Slot {
                entry,
                cancel: CancellationToken::new(),
            },
        );
        debug!(%build_id, namespace, index_name, origin_term, "registered index build");
        self.emit(BuildEvent::Registered {
            build_id,
            namespace: namespace.to_string(),
            index_name: index_name.to_string(),
        });
        Ok(build_id)
    }

    /// Move a build to `next`, returning the previous state
    pub fn transition(&self, build_id: BuildId, next: BuildState) -> Result<BuildState> {
        self.with_slot(build_id, |slot| {
            let from = slot.entry.transition(next)?;
            if next == BuildState::Aborting {
                slot.cancel.cancel();
            }
            self.emit_state_change(&slot.entry, from);
            Ok(from)
        })
    }

    /// Ask a running build to stop
    ///
    /// Never blocks on the build itself; the build observes the request at its
    /// next checkpoint.
    pub fn request_abort(&self, build_id: BuildId, reason: &str) -> Result<AbortRequest> {
        self.with_slot(build_id, |slot| {
            let entry = &mut slot.entry;
            if entry.state.is_terminal() {
                return Ok(AbortRequest::Finished);
            }
            if entry.state == BuildState::Aborting {
                return Ok(AbortRequest::AlreadyAborting);
            }
            if entry.committing {
                return Ok(AbortRequest::Committing);
            }
            let from = entry.transition(BuildState::Aborting)?;
            entry.abort_reason = Some(reason.to_string());
            slot.cancel.cancel();
            self.emit_state_change(&slot.entry, from);
            Ok(AbortRequest::Requested)
        })
    }

    /// Commit fence: after this returns `true` the build can no longer be aborted
    ///
    /// Returns `false` if an abort got there first.
    pub fn begin_commit(&self, build_id: BuildId) -> Result<bool> {
        self.with_slot(build_id, |slot| match slot.entry.state {
            BuildState::Scanning if !slot.cancel.is_cancelled() => {
                slot.entry.committing = true;
                Ok(true)
            }
            BuildState::Scanning | BuildState::Aborting => Ok(false),
            state => Err(CoordinatorError::InvalidTransition {
                build_id,
                from: state,
                to: BuildState::Committed,
            }),
        })
    }

    /// Remove a terminal entry
    pub fn retire(&self, build_id: BuildId) -> Result<IndexBuildEntry> {
        let builds = self.namespace_of(build_id)?;
        let mut builds = builds.lock();
        let state = builds
            .slots
            .get(&build_id)
            .map(|slot| slot.entry.state)
            .ok_or(CoordinatorError::BuildNotFound(build_id))?;
        if !state.is_terminal() {
            return Err(CoordinatorError::RetireLiveBuild { build_id, state });
        }
        self.remove(&mut builds, build_id)
    }

    /// Move to a terminal state and retire in one step
    ///
    /// Nobody can observe the terminal entry before it is gone, so a waiter
    /// sees the name either held or free.
    pub fn finish(&self, build_id: BuildId, final_state: BuildState) -> Result<IndexBuildEntry> {
        if !final_state.is_terminal() {
            return Err(CoordinatorError::internal(format!(
                "finish requires a terminal state, got {}",
                final_state
            )));
        }
        let builds = self.namespace_of(build_id)?;
        let mut builds = builds.lock();
        let slot = builds
            .slots
            .get_mut(&build_id)
            .ok_or(CoordinatorError::BuildNotFound(build_id))?;
        let from = slot.entry.transition(final_state)?;
        self.emit_state_change(&slot.entry, from);
        self.remove(&mut builds, build_id)
    }

    pub fn cancellation_token(&self, build_id: BuildId) -> Result<CancellationToken> {
        self.with_slot(build_id, |slot| Ok(slot.cancel.clone()))
    }

    /// Snapshot of a build
    pub fn get(&self, build_id: BuildId) -> Option<IndexBuildEntry> {
        self.with_slot(build_id, |slot| Ok(slot.entry.clone())).ok()
    }

    /// Snapshot of the non-retired build using `index_name`, if any
    pub fn find(&self, namespace: &str, index_name: &str) -> Option<IndexBuildEntry> {
        let builds = self.namespaces.get(namespace).map(|b| b.value().clone())?;
        let builds = builds.lock();
        builds.by_name(index_name).map(|slot| slot.entry.clone())
    }

    /// Snapshot of every non-retired build
    pub fn entries(&self) -> Vec<IndexBuildEntry> {
        let shards: Vec<_> = self
            .namespaces
            .iter()
            .map(|item| item.value().clone())
            .collect();
        shards
            .iter()
            .flat_map(|builds| {
                builds
                    .lock()
                    .slots
                    .values()
                    .map(|slot| slot.entry.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    fn namespace(&self, namespace: &str) -> Arc<Mutex<NamespaceBuilds>> {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn namespace_of(&self, build_id: BuildId) -> Result<Arc<Mutex<NamespaceBuilds>>> {
        let namespace = self
            .locations
            .get(&build_id)
            .map(|ns| ns.value().clone())
            .ok_or(CoordinatorError::BuildNotFound(build_id))?;
        self.namespaces
            .get(&namespace)
            .map(|b| b.value().clone())
            .ok_or(CoordinatorError::BuildNotFound(build_id))
    }

    fn with_slot<T>(
        &self,
        build_id: BuildId,
        f: impl FnOnce(&mut Slot) -> Result<T>,
    ) -> Result<T> {
        let builds = self.namespace_of(build_id)?;
        let mut builds = builds.lock();
        let slot = builds
            .slots
            .get_mut(&build_id)
            .ok_or(CoordinatorError::BuildNotFound(build_id))?;
        f(slot)
    }

    // Caller holds the namespace lock.
    fn remove(&self, builds: &mut NamespaceBuilds, build_id: BuildId) -> Result<IndexBuildEntry> {
        let entry = builds
            .slots
            .remove(&build_id)
            .map(|slot| slot.entry)
            .ok_or(CoordinatorError::BuildNotFound(build_id))?;
        self.locations.remove(&build_id);
        if builds.slots.is_empty() {
            // While attached, this shard is the one mapped under its namespace.
            builds.detached = true;
            self.namespaces.remove(&entry.namespace);
        }
        debug!(%build_id, state = %entry.state, "retired index build");
        self.emit(BuildEvent::Retired {
            build_id,
            namespace: entry.namespace.clone(),
            index_name: entry.index_name.clone(),
            final_state: entry.state,
        });
        Ok(entry)
    }

    fn emit_state_change(&self, entry: &IndexBuildEntry, from: BuildState) {
        debug!(build_id = %entry.build_id, %from, to = %entry.state, "index build state change");
        self.emit(BuildEvent::StateChanged {
            build_id: entry.build_id,
            namespace: entry.namespace.clone(),
            index_name: entry.index_name.clone(),
            from,
            to: entry.state,
        });
    }

    fn emit(&self, event: BuildEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

impl Default for BuildRegistry {
    fn default() -> Self {
        Self::new(1024)
    }
}
