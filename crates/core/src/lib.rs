//! lixmerge core library.
//!
//! This crate provides the pluggable change-tracking and merge protocol:
//! the change model, the plugin registry, diffing and change application,
//! conflict detection and resolution, and the multi-file merge engine.

pub mod applier;
pub mod blob;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod errors;
pub mod merge_engine;
pub mod models;
pub mod plugin;
pub mod registry;
pub mod replica;
pub mod telemetry;
pub mod validation;

#[cfg(test)]
mod test_support;

// Re-exports for convenience.
pub use applier::ChangeApplier;
pub use config::{EngineConfig, ProcessRole};
pub use conflict::{Conflict, ConflictDetector, ConflictResolver, Resolution, ResolutionStrategy};
pub use diff::DiffEngine;
pub use errors::CoreError;
pub use merge_engine::{FileOutcome, MergeEngine, MergeReport};
pub use models::{Change, DiffReport, EntityKind, LixFile, Operation, ReplicaId, Snapshot};
pub use plugin::{Capabilities, Entity, Plugin};
pub use registry::PluginRegistry;
pub use replica::{InMemoryReplica, Replica};
pub use telemetry::Telemetry;
pub use validation::ValidatingPlugin;
