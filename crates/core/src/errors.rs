//! Error types for the lixmerge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::models::{EntityKey, Operation};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolution(#[from] PluginResolutionError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    ConflictDetection(#[from] ConflictDetectionError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Change(#[from] ChangeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Change model errors
// ---------------------------------------------------------------------------

/// Violations of the before/after presence rules on changes and diff reports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChangeError {
    /// An update or delete carried no `before` snapshot.
    #[error("{operation} of '{entity_id}' is missing its before snapshot")]
    MissingBefore {
        operation: Operation,
        entity_id: String,
    },

    /// A create carried a `before` snapshot.
    #[error("create of '{entity_id}' must not carry a before snapshot")]
    UnexpectedBefore { entity_id: String },

    /// A create or update carried no `after` snapshot.
    #[error("{operation} of '{entity_id}' is missing its after snapshot")]
    MissingAfter {
        operation: Operation,
        entity_id: String,
    },

    /// A delete carried an `after` snapshot.
    #[error("delete of '{entity_id}' must not carry an after snapshot")]
    UnexpectedAfter { entity_id: String },

    /// `before` and `after` describe different entities.
    #[error("snapshot ids differ: before '{before}', after '{after}'")]
    IdMismatch { before: String, after: String },

    /// Neither a `before` nor an `after` snapshot was given.
    #[error("a change needs at least one of before/after")]
    EmptyTransition,

    /// A JSON value could not be read as an entity snapshot.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

/// Errors from plugin registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A plugin with the same key is already registered.
    #[error("plugin key '{0}' is already registered")]
    DuplicateKey(String),

    /// The plugin's glob pattern is malformed.
    #[error("invalid glob '{pattern}': {detail}")]
    InvalidGlob { pattern: String, detail: String },
}

/// No plugin owns a file. Callers fall back to opaque-blob handling.
#[derive(Debug, Error)]
pub enum PluginResolutionError {
    #[error("no plugin matches '{path}'")]
    NoMatch { path: String },
}

// ---------------------------------------------------------------------------
// Plugin errors
// ---------------------------------------------------------------------------

/// Failures raised by plugin code.
#[derive(Debug, Error)]
pub enum PluginError {
    /// One-time setup failed.
    #[error("setup of plugin '{plugin}' failed: {detail}")]
    Setup { plugin: String, detail: String },

    /// The plugin does not implement the requested capability.
    #[error("plugin '{plugin}' does not support {capability}")]
    Unsupported {
        plugin: String,
        capability: &'static str,
    },

    /// The plugin emitted a report that breaks the presence rules.
    #[error("plugin '{plugin}' produced an invalid diff report: {source}")]
    InvalidReport {
        plugin: String,
        #[source]
        source: ChangeError,
    },

    /// A snapshot did not satisfy the registered entity schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Decomposition of a file failed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Any other plugin failure.
    #[error("plugin '{plugin}' failed: {detail}")]
    Other { plugin: String, detail: String },
}

/// Entity decomposition failed. The diff engine recovers by emitting a
/// whole-file report.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The file content does not follow the plugin's format.
    #[error("cannot parse '{path}' with plugin '{plugin}': {detail}")]
    Malformed {
        plugin: String,
        path: String,
        detail: String,
    },

    /// The same entity appeared twice in one file.
    #[error("duplicate entity {entity} in '{path}'")]
    DuplicateEntity { path: String, entity: EntityKey },

    /// An entity of a kind the plugin did not declare.
    #[error("plugin '{plugin}' produced undeclared entity kind '{kind}'")]
    UndeclaredKind { plugin: String, kind: String },

    /// A parsed entity failed schema validation.
    #[error("entity {entity} violates its schema: {detail}")]
    SchemaViolation { entity: EntityKey, detail: String },

    /// JSON decoding error.
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Apply errors
// ---------------------------------------------------------------------------

/// A change could not be applied to a file.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// `create` targeted an entity that already exists.
    #[error("cannot create {0}: entity already exists")]
    EntityExists(EntityKey),

    /// `update` or `delete` targeted an entity that does not exist.
    #[error("cannot {operation} {entity}: entity does not exist")]
    EntityMissing {
        operation: Operation,
        entity: EntityKey,
    },

    /// A whole-file change was computed against different bytes.
    #[error("whole-file {operation} on '{file_id}' expects a different base")]
    StaleBase {
        operation: Operation,
        file_id: String,
    },

    /// Whole-file and entity-level changes were mixed in one set.
    #[error("whole-file and entity changes cannot be mixed for '{0}'")]
    MixedGranularity(String),

    /// A change belongs to another file.
    #[error("change {change_id} belongs to '{found}', not '{expected}'")]
    WrongFile {
        change_id: String,
        expected: String,
        found: String,
    },

    /// Entity-level changes arrived for a file no plugin owns.
    #[error("no plugin can apply entity changes to '{0}'")]
    NoPlugin(String),

    /// The owning plugin does not handle this entity kind.
    #[error("plugin '{plugin}' cannot apply {kind} entities")]
    UnsupportedKind { plugin: String, kind: String },

    /// Invalid change record.
    #[error(transparent)]
    InvalidChange(#[from] ChangeError),

    /// The base file could not be decomposed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A whole-file snapshot could not be decoded.
    #[error("cannot decode file snapshot: {0}")]
    Decode(String),

    /// The plugin failed to serialize the resulting entities.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// Conflict detection / replica errors
// ---------------------------------------------------------------------------

/// A plugin failed to compute conflicts. Halts the merge of one file only.
#[derive(Debug, Error)]
pub enum ConflictDetectionError {
    #[error("conflict detection by plugin '{plugin}' failed: {detail}")]
    Plugin { plugin: String, detail: String },

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// Errors from replica history access.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The replica cannot be read right now.
    #[error("replica '{0}' is unavailable")]
    Unavailable(String),

    /// The history backend failed.
    #[error("replica '{replica}' history error: {detail}")]
    History { replica: String, detail: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
