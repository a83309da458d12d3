//! Line-based three-way merge of text field values.
//!
//! Field-union resolution calls [`Merger::merge_text`] when both replicas
//! edited the same string field of an entity.

use std::ops::RangeInclusive;

use tracing::debug;

/// Outcome of merging two edits of one text value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMerge {
    /// Both edits combined without overlap.
    Clean(String),
    /// Overlapping edits. `text` carries diff3-style marker blocks and
    /// `regions` their 1-indexed line spans.
    Conflicted {
        text: String,
        regions: Vec<RangeInclusive<usize>>,
    },
}

impl TextMerge {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean(_))
    }

    /// The merged value, if no edits overlapped.
    pub fn into_clean(self) -> Option<String> {
        match self {
            Self::Clean(text) => Some(text),
            Self::Conflicted { .. } => None,
        }
    }
}

/// Stateless text merger.
pub struct Merger;

impl Merger {
    /// Merge `ours` and `theirs`, both edited from `base`.
    pub fn merge_text(base: &str, ours: &str, theirs: &str) -> TextMerge {
        if ours == base || ours == theirs {
            return TextMerge::Clean(theirs.to_string());
        }
        if theirs == base {
            return TextMerge::Clean(ours.to_string());
        }

        match diffy::merge(base, ours, theirs) {
            Ok(merged) => {
                debug!(lines = merged.lines().count(), "text edits merged");
                TextMerge::Clean(merged)
            }
            Err(text) => {
                let regions = marker_regions(&text);
                debug!(regions = regions.len(), "text edits overlap");
                TextMerge::Conflicted { text, regions }
            }
        }
    }
}

/// Line spans of `<<<<<<<` .. `>>>>>>>` blocks.
fn marker_regions(text: &str) -> Vec<RangeInclusive<usize>> {
    let mut regions = Vec::new();
    let mut open = None;
    for (line_no, line) in (1..).zip(text.lines()) {
        if line.starts_with("<<<<<<<") {
            open = Some(line_no);
        } else if line.starts_with(">>>>>>>") {
            if let Some(start) = open.take() {
                regions.push(start..=line_no);
            }
        }
    }
    regions
}
