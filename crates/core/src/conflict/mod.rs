//! Conflict detection, three-way merging, and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- folding two replicas' changes per entity and finding
//!    incompatible edits.
//! 2. **Merging** -- line-based three-way merges of text fields.
//! 3. **Resolution** -- plugin-specific or strategy-based automatic
//!    resolution, expressed as new changes.

pub mod detector;
pub mod merger;
pub mod resolver;

pub use detector::{
    exclude_shared, net_changes, pending_changes, Conflict, ConflictDetector, ConflictKey,
    ConflictType, NetChange,
};
pub use merger::{Merger, TextMerge};
pub use resolver::{ConflictResolver, Resolution, ResolutionStrategy};
