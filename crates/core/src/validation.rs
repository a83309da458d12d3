//! Optional schema validation around any plugin.
//!
//! [`ValidatingPlugin`] checks every entity snapshot the wrapped plugin
//! parses, reports, or is asked to apply against an [`EntitySchema`] for its
//! kind. Kinds without a schema pass through unchecked.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::conflict::{Conflict, Resolution};
use crate::errors::{ApplyError, ConflictDetectionError, ParseError, PluginError};
use crate::models::{DiffReport, EntityKey, EntityKind, LixFile, Snapshot};
use crate::plugin::{ApplyArgs, Capabilities, ConflictArgs, Entity, Plugin};

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

/// JSON type a snapshot field must have.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Bool,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

/// Shape of one entity kind's snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub required: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub optional: BTreeMap<String, FieldType>,
    /// Accept fields not listed above.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, ty: FieldType) -> Self {
        self.required.insert(name.to_string(), ty);
        self
    }

    pub fn optional(mut self, name: &str, ty: FieldType) -> Self {
        self.optional.insert(name.to_string(), ty);
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    /// Check one snapshot, describing the first violation.
    pub fn check(&self, snapshot: &Snapshot) -> Result<(), String> {
        for (name, ty) in &self.required {
            match snapshot.get(name) {
                None => return Err(format!("missing required field '{name}'")),
                Some(value) if !ty.accepts(value) => {
                    return Err(format!("field '{name}' must be of type {ty:?}"))
                }
                Some(_) => {}
            }
        }
        for (name, value) in &snapshot.fields {
            if self.required.contains_key(name) {
                continue;
            }
            match self.optional.get(name) {
                Some(ty) if !ty.accepts(value) => {
                    return Err(format!("field '{name}' must be of type {ty:?}"))
                }
                Some(_) => {}
                None if !self.allow_unknown => return Err(format!("unknown field '{name}'")),
                None => {}
            }
        }
        Ok(())
    }
}

/// Schemas keyed by entity kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSet {
    #[serde(default)]
    pub schemas: BTreeMap<EntityKind, EntitySchema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: EntityKind, schema: EntitySchema) -> Self {
        self.schemas.insert(kind, schema);
        self
    }

    pub fn check(&self, kind: EntityKind, snapshot: &Snapshot) -> Result<(), ParseError> {
        let Some(schema) = self.schemas.get(&kind) else {
            return Ok(());
        };
        schema
            .check(snapshot)
            .map_err(|detail| ParseError::SchemaViolation {
                entity: EntityKey::new(kind, snapshot.id.clone()),
                detail,
            })
    }

    fn check_report(&self, report: &DiffReport) -> Result<(), ParseError> {
        match &report.neu {
            Some(neu) => self.check(report.entity_type, neu),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Wrapper plugin
// ---------------------------------------------------------------------------

/// Wraps a plugin and validates the snapshots flowing through it.
pub struct ValidatingPlugin<P> {
    inner: P,
    schemas: SchemaSet,
}

impl<P: Plugin> ValidatingPlugin<P> {
    pub fn new(inner: P, schemas: SchemaSet) -> Self {
        Self { inner, schemas }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    /// Reported snapshots that violate a schema surface as parse errors, so
    /// the diff falls back to a whole-file report as it does for `parse`.
    fn reject_reports(&self, reports: &[DiffReport]) -> Result<(), PluginError> {
        for report in reports {
            if let Err(e) = self.schemas.check_report(report) {
                debug!(plugin = self.inner.key(), error = %e, "diff report rejected");
                return Err(PluginError::Parse(e));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Plugin> Plugin for ValidatingPlugin<P> {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn glob(&self) -> &str {
        self.inner.glob()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn setup(&self) -> Result<(), PluginError> {
        self.inner.setup().await
    }

    fn parse(&self, file: &LixFile) -> Result<Vec<Entity>, ParseError> {
        let entities = self.inner.parse(file)?;
        for entity in &entities {
            self.schemas.check(entity.kind, &entity.snapshot)?;
        }
        Ok(entities)
    }

    fn serialize(&self, base: &LixFile, entities: &[Entity]) -> Result<Vec<u8>, ApplyError> {
        self.inner.serialize(base, entities)
    }

    async fn diff_file(
        &self,
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let reports = self.inner.diff_file(old, neu).await?;
        self.reject_reports(&reports)?;
        Ok(reports)
    }

    async fn diff_entity(
        &self,
        kind: EntityKind,
        old: Option<&Snapshot>,
        neu: Option<&Snapshot>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let reports = self.inner.diff_entity(kind, old, neu).await?;
        self.reject_reports(&reports)?;
        Ok(reports)
    }

    async fn apply_changes(&self, args: ApplyArgs<'_>) -> Result<Vec<u8>, ApplyError> {
        for change in args.changes {
            if let Some(after) = &change.after {
                self.schemas.check(change.entity_type, after)?;
            }
        }
        self.inner.apply_changes(args).await
    }

    async fn report_conflicts(
        &self,
        args: ConflictArgs<'_>,
    ) -> Result<Vec<Conflict>, ConflictDetectionError> {
        self.inner.report_conflicts(args).await
    }

    async fn try_resolve_conflict(&self, conflict: &Conflict) -> Result<Resolution, PluginError> {
        let resolution = self.inner.try_resolve_conflict(conflict).await?;
        if let Some(after) = resolution.change().and_then(|c| c.after.as_ref()) {
            self.schemas
                .check(conflict.entity.entity_type, after)
                .map_err(|e| PluginError::SchemaViolation(e.to_string()))?;
        }
        Ok(resolution)
    }
}
