//! Key/value labels attached to executions.
//!
//! Labels under the `system.` prefix are reserved for the engine itself
//! (replay provenance, trigger bookkeeping); user labels live anywhere else.

use serde::{Deserialize, Serialize};

/// Reserved prefix for engine-owned labels.
pub const SYSTEM_PREFIX: &str = "system.";

/// Marks an execution as a replay of another; value is the source id.
pub const REPLAY_OF: &str = "system.replayOf";

/// A single execution label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Label {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.key.starts_with(SYSTEM_PREFIX)
    }
}

/// True when every label in `wanted` already exists in `existing`.
pub fn contains_all(existing: &[Label], wanted: &[Label]) -> bool {
    wanted.iter().all(|label| existing.contains(label))
}

/// Merge `updates` into `existing`, overriding entries with the same key.
pub fn merge(existing: &[Label], updates: &[Label]) -> Vec<Label> {
    let mut merged: Vec<Label> = existing
        .iter()
        .filter(|label| !updates.iter().any(|u| u.key == label.key))
        .cloned()
        .collect();
    merged.extend(updates.iter().cloned());
    merged
}
