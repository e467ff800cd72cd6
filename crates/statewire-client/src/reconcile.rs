//! Client-side reconciliation of optimistic local writes.
//!
//! Local writes are shown immediately by overlaying them on the confirmed
//! mirror. A write leaves the overlay when the backend acknowledges it (a
//! patch whose `origin` is the write's id), rejects it, or confirms a
//! different value for the same field first.

use serde_json::{Map, Value};
use tracing::debug;

use statewire_core::patch::{PatchEvent, PatchMode, apply_mode};
use statewire_core::protocol::OverrideCommand;

/// Why a staged write left the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Acknowledged(String),
    Superseded(String),
    Rejected(String),
}

#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    writes: Vec<OverrideCommand>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OverrideCommand> {
        self.writes.iter()
    }

    pub fn stage(&mut self, command: OverrideCommand) {
        self.writes.push(command);
    }

    /// Settle writes affected by a confirmed remote patch.
    ///
    /// The write named by the patch's origin is acknowledged; later writes
    /// of ours to the same field stay pending on top of it. A patch from
    /// anyone else supersedes every non-append write to its field: the
    /// canonical container has a newer value and it wins outright.
    pub fn confirm(&mut self, patch: &PatchEvent) -> Vec<Settled> {
        let own = patch
            .origin
            .as_deref()
            .is_some_and(|origin| self.writes.iter().any(|w| w.id == origin));
        let mut settled = Vec::new();
        self.writes.retain(|w| {
            if patch.origin.as_deref() == Some(w.id.as_str()) {
                settled.push(Settled::Acknowledged(w.id.clone()));
                return false;
            }
            if !own && w.target_field == patch.target_field && w.mode != PatchMode::Append && patch.seq > w.base_seq {
                debug!(override_id = %w.id, field = %w.target_field, seq = patch.seq, "Local write superseded");
                settled.push(Settled::Superseded(w.id.clone()));
                return false;
            }
            true
        });
        settled
    }

    pub fn reject(&mut self, override_id: &str) -> Option<Settled> {
        let idx = self.writes.iter().position(|w| w.id == override_id)?;
        let write = self.writes.remove(idx);
        Some(Settled::Rejected(write.id))
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// The confirmed values with every pending write applied in staging order.
    pub fn overlay(&self, confirmed: &Map<String, Value>) -> Map<String, Value> {
        let mut mirror = confirmed.clone();
        for write in &self.writes {
            let slot = mirror.entry(write.target_field.clone()).or_insert(Value::Null);
            apply_mode(slot, write.mode, &write.payload);
        }
        mirror
    }
}
