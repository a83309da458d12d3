//! Whole-file snapshots for content no plugin can decompose.
//!
//! A whole-file snapshot carries the file path, a SHA-256 digest of the
//! bytes, and the bytes themselves base64-encoded so a change can be replayed
//! without access to the original file.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::errors::ApplyError;
use crate::models::{DiffReport, EntityKind, LixFile, Snapshot};

/// Plugin key recorded on changes for files without an owning plugin.
pub const OPAQUE_PLUGIN_KEY: &str = "lix_opaque_blob";

/// Hex-encoded SHA-256 of `data`.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Build the whole-file snapshot for `file`.
pub fn file_snapshot(file: &LixFile) -> Snapshot {
    Snapshot::new(file.id.clone())
        .with_field("path", file.path.clone())
        .with_field("sha256", digest(&file.data))
        .with_field("size", file.data.len() as u64)
        .with_field("data", STANDARD.encode(&file.data))
}

/// Digest recorded in a whole-file snapshot, if any.
pub fn snapshot_digest(snapshot: &Snapshot) -> Option<&str> {
    snapshot.get("sha256").and_then(|v| v.as_str())
}

/// Recover the file bytes from a whole-file snapshot.
pub fn decode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, ApplyError> {
    let encoded = snapshot
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApplyError::Decode(format!("snapshot '{}' has no data", snapshot.id)))?;
    let data = STANDARD
        .decode(encoded)
        .map_err(|e| ApplyError::Decode(e.to_string()))?;
    if let Some(expected) = snapshot_digest(snapshot) {
        if digest(&data) != expected {
            return Err(ApplyError::Decode(format!(
                "digest mismatch for snapshot '{}'",
                snapshot.id
            )));
        }
    }
    Ok(data)
}

/// The single whole-file report describing `old -> neu`, or `None` when the
/// bytes are unchanged or both sides are absent.
pub fn whole_file_report(old: Option<&LixFile>, neu: Option<&LixFile>) -> Option<DiffReport> {
    match (old, neu) {
        (None, None) => None,
        (None, Some(n)) => Some(DiffReport::create(EntityKind::File, file_snapshot(n))),
        (Some(o), None) => Some(DiffReport::delete(EntityKind::File, file_snapshot(o))),
        (Some(o), Some(n)) if o.data == n.data => None,
        (Some(o), Some(n)) => {
            // Both states are the same file; keep the id stable across renames.
            let mut neu_snapshot = file_snapshot(n);
            neu_snapshot.id = o.id.clone();
            Some(DiffReport::update(
                EntityKind::File,
                file_snapshot(o),
                neu_snapshot,
            ))
        }
    }
}
