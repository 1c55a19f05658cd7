/*
 * Index Build Coordinator
 *
 * Coordinates secondary index builds on a replicated database node.
 *
 * Architecture:
 * - Build Registry (per-namespace locks, broadcast state events)
 * - Build Task (chunked scan, cancellable at chunk boundaries)
 * - Interrupt Controller (stepdown -> abort requests)
 * - Replication Applier Bridge (committed log -> replicated builds)
 * - Conflict Resolver (wait for retirement, or fatal halt)
 *
 * A replicated build is never admitted while a build with the same name is
 * still winding down. Unresolved collisions halt the node; restart recovery
 * and log replay converge on the replicated outcome.
 */

// Public modules
pub mod applier;
pub mod build;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod failpoint;
pub mod interrupt;
pub mod lifecycle;
pub mod registry;
pub mod replication;
pub mod resolver;
pub mod task;

// Re-exports
pub use applier::{ApplyOutcome, ApplyReport, OplogApplier};
pub use build::{BuildId, BuildOrigin, BuildState, IndexBuildEntry};
pub use config::{ConfigError, ConflictPolicy, CoordinatorConfig};
pub use coordinator::{IndexBuildCoordinator, RecoveryReport};
pub use error::{CoordinatorError, ErrorCategory, Result};
pub use events::{
    BuildEvent, DiagnosticEvent, DiagnosticsSink, RecordingDiagnostics, TracingDiagnostics,
};
pub use failpoint::{FailPoint, FailPoints};
pub use interrupt::InterruptController;
pub use lifecycle::{FatalHalt, HaltSignal, FATAL_HALT_EXIT_CODE};
pub use registry::{AbortRequest, BuildRegistry};
pub use replication::{
    CommittedLog, InMemoryOplog, LeadershipChange, LeadershipEvent, MemberState, OpTime,
    OplogEntry, OplogOperation, ReplicationState, Role,
};
pub use resolver::{Conflict, ConflictKind, ConflictResolver};
pub use task::{BuildContext, BuildHandle, BuildOutcome, BuildTask};
