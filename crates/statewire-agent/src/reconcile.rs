//! Canonical-side reconciliation of client override commands.

use statewire_core::error::{Result, SyncError};
use statewire_core::patch::{PatchDraft, PatchMode};
use statewire_core::protocol::OverrideCommand;
use statewire_core::shape::ShapeRegistry;
use statewire_core::state::StateContainer;

/// Decide whether `command` may be folded into the canonical container.
///
/// A replace or merge is refused when its field was written after the
/// sequence number the client based the write on; appends never conflict.
/// `chained_from` is the base of the same subscriber's accepted override
/// that last wrote the field, if nothing has written it since: a write
/// based at or after it only follows the client's own edit and is let through.
/// The returned draft has been validated against the field's spec.
pub fn reconcile(
    state: &StateContainer,
    command: &OverrideCommand,
    chained_from: Option<u64>,
    shapes: &ShapeRegistry,
) -> Result<PatchDraft> {
    let current_seq = state.version(&command.target_field);
    let chained = chained_from.is_some_and(|base| command.base_seq >= base);
    if command.mode != PatchMode::Append && current_seq > command.base_seq && !chained {
        return Err(SyncError::ConflictOverride {
            field: command.target_field.clone(),
            base_seq: command.base_seq,
            current_seq,
        });
    }

    let draft = command.draft();
    state.validate(&draft, shapes)?;
    Ok(draft)
}
