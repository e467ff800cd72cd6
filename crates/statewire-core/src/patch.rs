//! Patch events: incremental, sequenced changes to one state field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::deep_merge;

/// How a payload is folded into its target field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchMode {
    /// Replace the field wholesale.
    #[default]
    Replace,
    /// Push the payload as one new element of an append-only sequence.
    Append,
    /// Deep-merge an object payload into the current object value.
    Merge,
}

impl std::fmt::Display for PatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchMode::Replace => write!(f, "replace"),
            PatchMode::Append => write!(f, "append"),
            PatchMode::Merge => write!(f, "merge"),
        }
    }
}

/// A patch that has not been assigned a sequence number yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDraft {
    pub target_field: String,
    pub payload: Value,
    pub mode: PatchMode,
}

impl PatchDraft {
    pub fn new(target_field: impl Into<String>, payload: Value, mode: PatchMode) -> Self {
        Self {
            target_field: target_field.into(),
            payload,
            mode,
        }
    }

    pub fn replace(target_field: impl Into<String>, payload: Value) -> Self {
        Self::new(target_field, payload, PatchMode::Replace)
    }

    pub fn append(target_field: impl Into<String>, payload: Value) -> Self {
        Self::new(target_field, payload, PatchMode::Append)
    }

    pub fn merge(target_field: impl Into<String>, payload: Value) -> Self {
        Self::new(target_field, payload, PatchMode::Merge)
    }

    /// Stamp the draft with its session sequence number.
    pub fn sequenced(self, seq: u64) -> PatchEvent {
        PatchEvent {
            target_field: self.target_field,
            payload: self.payload,
            mode: self.mode,
            seq,
            origin: None,
        }
    }
}

/// A sequenced patch as carried on the transport channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEvent {
    pub target_field: String,
    pub payload: Value,
    pub mode: PatchMode,
    #[serde(rename = "sequenceNumber")]
    pub seq: u64,
    /// Id of the override command this patch confirms, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl PatchEvent {
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn draft(&self) -> PatchDraft {
        PatchDraft {
            target_field: self.target_field.clone(),
            payload: self.payload.clone(),
            mode: self.mode,
        }
    }
}

/// Fold `payload` into `target` according to `mode`, without any type checks.
///
/// `Append` onto a missing or null value starts a new sequence; `Merge` onto a
/// non-object value degrades to a replace.
pub fn apply_mode(target: &mut Value, mode: PatchMode, payload: &Value) {
    match mode {
        PatchMode::Replace => *target = payload.clone(),
        PatchMode::Append => match target {
            Value::Array(items) => items.push(payload.clone()),
            other => *other = Value::Array(vec![payload.clone()]),
        },
        PatchMode::Merge => deep_merge(target, payload),
    }
}
