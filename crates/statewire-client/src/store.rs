//! Client state store: the subscriber's mirror of a session's state.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use statewire_core::error::{Result, SyncError};
use statewire_core::patch::{PatchEvent, PatchMode};
use statewire_core::protocol::{ErrorShape, OverrideCommand, SyncEvent};
use statewire_core::session::{SessionId, SessionStatus};
use statewire_core::state::{StateContainer, changed_fields};

use crate::reconcile::{PendingWrites, Settled};

/// Change notification published after every visible mirror update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorChange {
    /// Bumped on every notification.
    pub version: u64,
    /// Last applied sequence number.
    pub seq: u64,
    pub status: SessionStatus,
    pub changed_fields: Vec<String>,
}

/// What [`ClientStore::ingest`] did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// Applied this many sequenced events (the event plus any it unblocked).
    Applied(usize),
    /// Held until the missing earlier events arrive.
    Buffered,
    /// Already applied; ignored.
    Duplicate,
    /// Dropped while waiting for a resync snapshot.
    Discarded,
    /// A local write was refused by the backend.
    Rejected { override_id: String, error: ErrorShape },
}

pub struct ClientStore {
    session_id: SessionId,
    confirmed: StateContainer,
    pending: PendingWrites,
    mirror: Map<String, Value>,
    last_seq: u64,
    /// Mirror still shows the caller's default.
    seeded: bool,
    awaiting_snapshot: bool,
    reorder: BTreeMap<u64, SyncEvent>,
    window: usize,
    status: SessionStatus,
    last_error: Option<ErrorShape>,
    changes: watch::Sender<MirrorChange>,
}

impl ClientStore {
    pub fn new(session_id: SessionId, window: usize) -> Self {
        let (changes, _) = watch::channel(MirrorChange::default());
        Self {
            session_id,
            confirmed: StateContainer::new(),
            pending: PendingWrites::new(),
            mirror: Map::new(),
            last_seq: 0,
            seeded: false,
            awaiting_snapshot: false,
            reorder: BTreeMap::new(),
            window: window.max(1),
            status: SessionStatus::Initializing,
            last_error: None,
            changes,
        }
    }

    /// Show `default` until the first snapshot or patch replaces it wholesale.
    pub fn with_default(mut self, default: Map<String, Value>) -> Self {
        self.mirror = default;
        self.seeded = true;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn mirror(&self) -> &Map<String, Value> {
        &self.mirror
    }

    pub fn current_mirror(&self) -> Value {
        Value::Object(self.mirror.clone())
    }

    /// Confirmed state only, without pending local writes.
    pub fn confirmed(&self) -> &Map<String, Value> {
        self.confirmed.values()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn last_error(&self) -> Option<&ErrorShape> {
        self.last_error.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &OverrideCommand> {
        self.pending.iter()
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    pub fn changes(&self) -> watch::Receiver<MirrorChange> {
        self.changes.subscribe()
    }

    /// Stage an optimistic local write. The mirror shows it at once; the
    /// returned command must be sent upstream.
    pub fn stage(&mut self, field: impl Into<String>, payload: Value, mode: PatchMode) -> Result<OverrideCommand> {
        if self.status.is_terminal() {
            return Err(SyncError::SessionClosed(self.session_id.to_string()));
        }
        let command = OverrideCommand::new(field, payload, mode, self.last_seq);
        debug!(session = %self.session_id, field = %command.target_field, override_id = %command.id, "Staged local write");
        self.pending.stage(command.clone());
        self.refresh(false);
        Ok(command)
    }

    /// Forget buffered events and ignore sequenced events until the next
    /// snapshot arrives.
    pub fn begin_resync(&mut self) {
        self.reorder.clear();
        self.awaiting_snapshot = true;
    }

    pub fn ingest(&mut self, event: SyncEvent) -> Result<Ingest> {
        match event {
            SyncEvent::Snapshot { seq, payload, status } => {
                self.install_snapshot(seq, payload, status)?;
                Ok(Ingest::Applied(1 + self.drain()))
            }
            SyncEvent::OverrideRejected {
                override_id,
                target_field,
                error,
            } => {
                warn!(session = %self.session_id, field = %target_field, override_id = %override_id, code = %error.code, "Local write rejected");
                if self.pending.reject(&override_id).is_some() {
                    self.refresh(false);
                }
                Ok(Ingest::Rejected { override_id, error })
            }
            event => {
                // Patch or lifecycle; both are sequenced.
                let Some(seq) = event.seq() else {
                    return Ok(Ingest::Discarded);
                };
                if self.awaiting_snapshot {
                    return Ok(Ingest::Discarded);
                }
                if seq <= self.last_seq {
                    return Ok(Ingest::Duplicate);
                }
                if seq > self.last_seq + 1 {
                    return self.hold(seq, event);
                }
                self.apply_sequenced(event);
                Ok(Ingest::Applied(1 + self.drain()))
            }
        }
    }

    fn hold(&mut self, seq: u64, event: SyncEvent) -> Result<Ingest> {
        let expected = self.last_seq + 1;
        if seq - expected >= self.window as u64 || self.reorder.len() >= self.window {
            warn!(session = %self.session_id, expected, received = seq, "Sequence gap beyond reorder window");
            return Err(SyncError::TransportGap {
                expected,
                received: seq,
            });
        }
        debug!(session = %self.session_id, expected, received = seq, "Buffering out-of-order event");
        self.reorder.insert(seq, event);
        Ok(Ingest::Buffered)
    }

    /// Apply buffered events that have become contiguous.
    fn drain(&mut self) -> usize {
        let mut applied = 0;
        // Anything at or below the new high-water mark is stale.
        self.reorder = self.reorder.split_off(&(self.last_seq + 1));
        while let Some(event) = self.reorder.remove(&(self.last_seq + 1)) {
            self.apply_sequenced(event);
            applied += 1;
        }
        applied
    }

    fn install_snapshot(&mut self, seq: u64, payload: Value, status: SessionStatus) -> Result<()> {
        let Value::Object(values) = payload else {
            return Err(SyncError::validation("<snapshot>", "snapshot payload must be an object"));
        };
        info!(session = %self.session_id, seq, status = %status, "Installing snapshot");
        self.confirmed.reset_to(values);
        // Writes still in flight come back as ordinary patches after this point.
        self.pending.clear();
        self.last_seq = seq;
        self.seeded = false;
        self.awaiting_snapshot = false;
        self.set_status(status);
        self.refresh(true);
        Ok(())
    }

    fn apply_sequenced(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Patch(patch) => self.apply_patch(patch),
            SyncEvent::Lifecycle { seq, status, error } => {
                self.last_seq = seq;
                if error.is_some() {
                    self.last_error = error;
                }
                self.set_status(status);
                self.refresh(true);
            }
            // Unsequenced or handled by `ingest`.
            SyncEvent::Snapshot { .. } | SyncEvent::OverrideRejected { .. } => {}
        }
    }

    fn apply_patch(&mut self, patch: PatchEvent) {
        if self.seeded {
            // First thing the backend told us: the default is discarded, not merged.
            self.confirmed.reset_to(Map::new());
            self.seeded = false;
        }
        self.confirmed.apply_unchecked(&patch.draft());
        for settled in self.pending.confirm(&patch) {
            if let Settled::Acknowledged(id) = settled {
                debug!(session = %self.session_id, override_id = %id, "Local write acknowledged");
            }
        }
        self.last_seq = patch.seq;
        self.refresh(false);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if status == self.status {
            return;
        }
        if self.status.can_transition_to(status) {
            self.status = status;
        } else {
            debug!(session = %self.session_id, from = %self.status, to = %status, "Ignoring backwards status");
        }
    }

    /// Recompute the visible mirror and notify if anything changed.
    fn refresh(&mut self, force: bool) {
        let next = self.pending.overlay(self.confirmed.values());
        let fields = changed_fields(&self.mirror, &next);
        self.mirror = next;

        if fields.is_empty() && !force {
            return;
        }
        let (seq, status) = (self.last_seq, self.status);
        self.changes.send_modify(|change| {
            change.version += 1;
            change.seq = seq;
            change.status = status;
            change.changed_fields = fields;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statewire_core::patch::PatchDraft;
    use statewire_core::shape::ShapeRegistry;

    fn store() -> ClientStore {
        ClientStore::new(SessionId::from("s"), 4)
    }

    fn snapshot(seq: u64, payload: Value) -> SyncEvent {
        SyncEvent::Snapshot {
            seq,
            payload,
            status: SessionStatus::Running,
        }
    }

    fn patch(seq: u64, draft: PatchDraft) -> SyncEvent {
        SyncEvent::Patch(draft.sequenced(seq))
    }

    fn message(seq: u64, text: &str) -> SyncEvent {
        patch(seq, PatchDraft::append("messages", json!({"role": "assistant", "content": text})))
    }

    #[test]
    fn test_weather_scenario_mirror() {
        let mut store = store();
        store
            .ingest(snapshot(0, json!({"final_response": null, "input": "nyc"})))
            .unwrap();
        let weather = json!({
            "conditions": "cloudy",
            "temperature": 70,
            "wind_direction": "NE",
            "wind_speed": 5
        });
        store
            .ingest(patch(1, PatchDraft::replace("final_response", weather.clone())))
            .unwrap();
        assert_eq!(
            store.current_mirror(),
            json!({"final_response": weather, "input": "nyc"})
        );
    }

    #[test]
    fn test_convergence_with_canonical() {
        let shapes = ShapeRegistry::new();
        let mut canonical = StateContainer::from_value(json!({"input": "nyc", "profile": {"a": 1}})).unwrap();
        let mut store = store();
        store.ingest(snapshot(0, canonical.to_value())).unwrap();

        let drafts = vec![
            PatchDraft::replace("input", json!("sf")),
            PatchDraft::merge("profile", json!({"b": {"c": 2}})),
            PatchDraft::append("messages", json!("one")),
            PatchDraft::merge("profile", json!({"b": {"d": 3}})),
            PatchDraft::append("messages", json!("two")),
        ];
        for (i, draft) in drafts.into_iter().enumerate() {
            let seq = i as u64 + 1;
            canonical.apply(&draft, seq, &shapes).unwrap();
            store.ingest(patch(seq, draft)).unwrap();
            assert_eq!(store.mirror(), canonical.values());
        }
    }

    #[test]
    fn test_replayed_patch_is_idempotent() {
        let mut store = store();
        store.ingest(snapshot(0, json!({"messages": []}))).unwrap();
        store.ingest(message(1, "hello")).unwrap();
        let once = store.current_mirror();
        assert_eq!(store.ingest(message(1, "hello")).unwrap(), Ingest::Duplicate);
        assert_eq!(store.current_mirror(), once);
    }

    #[test]
    fn test_reordered_messages_keep_emission_order() {
        let mut store = store();
        store.ingest(snapshot(0, json!({"messages": []}))).unwrap();
        assert_eq!(store.ingest(message(2, "second")).unwrap(), Ingest::Buffered);
        assert_eq!(store.ingest(message(1, "first")).unwrap(), Ingest::Applied(2));
        let contents: Vec<_> = store.mirror()["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(store.last_seq(), 2);
    }

    #[test]
    fn test_gap_beyond_window_is_reported() {
        let mut store = store();
        store.ingest(snapshot(0, json!({}))).unwrap();
        let err = store.ingest(message(9, "far ahead")).unwrap_err();
        assert!(matches!(err, SyncError::TransportGap { expected: 1, received: 9 }));
    }

    #[test]
    fn test_resync_discards_until_snapshot() {
        let mut store = store();
        store.ingest(snapshot(0, json!({"n": 0}))).unwrap();
        store.ingest(patch(2, PatchDraft::replace("n", json!(2)))).unwrap();
        store.begin_resync();
        assert_eq!(store.buffered(), 0);
        assert_eq!(
            store.ingest(patch(3, PatchDraft::replace("n", json!(3)))).unwrap(),
            Ingest::Discarded
        );
        store.ingest(snapshot(3, json!({"n": 3}))).unwrap();
        store.ingest(patch(4, PatchDraft::replace("n", json!(4)))).unwrap();
        assert_eq!(store.mirror()["n"], 4);
    }

    #[test]
    fn test_default_replaced_not_merged() {
        let default = json!({"final_response": "loading", "extra": true});
        let mut store = store().with_default(default.as_object().unwrap().clone());
        assert_eq!(store.current_mirror(), default);

        store.ingest(snapshot(0, json!({"input": "nyc"}))).unwrap();
        assert_eq!(store.current_mirror(), json!({"input": "nyc"}));

        let mut fresh = ClientStore::new(SessionId::from("s"), 4)
            .with_default(default.as_object().unwrap().clone());
        fresh.ingest(patch(1, PatchDraft::replace("input", json!("la")))).unwrap();
        assert_eq!(fresh.current_mirror(), json!({"input": "la"}));
    }

    #[test]
    fn test_local_write_is_optimistic_then_acknowledged() {
        let mut store = store();
        store.ingest(snapshot(3, json!({"input": "nyc"}))).unwrap();
        let cmd = store.stage("input", json!("sf"), PatchMode::Replace).unwrap();
        assert_eq!(cmd.base_seq, 3);
        assert_eq!(store.mirror()["input"], "sf");
        assert_eq!(store.confirmed()["input"], "nyc");

        store
            .ingest(SyncEvent::Patch(
                PatchDraft::replace("input", json!("sf")).sequenced(4).with_origin(&cmd.id),
            ))
            .unwrap();
        assert_eq!(store.pending().count(), 0);
        assert_eq!(store.mirror()["input"], "sf");
    }

    #[test]
    fn test_consecutive_writes_to_one_field_settle_in_order() {
        let mut store = store();
        store.ingest(snapshot(1, json!({"input": "nyc"}))).unwrap();
        let first = store.stage("input", json!("b"), PatchMode::Replace).unwrap();
        let second = store.stage("input", json!("bo"), PatchMode::Replace).unwrap();
        assert_eq!(second.base_seq, 1);

        store
            .ingest(SyncEvent::Patch(
                PatchDraft::replace("input", json!("b")).sequenced(2).with_origin(&first.id),
            ))
            .unwrap();
        assert_eq!(store.pending().count(), 1);
        assert_eq!(store.mirror()["input"], "bo");

        store
            .ingest(SyncEvent::Patch(
                PatchDraft::replace("input", json!("bo")).sequenced(3).with_origin(&second.id),
            ))
            .unwrap();
        assert_eq!(store.pending().count(), 0);
        assert_eq!(store.mirror()["input"], "bo");
    }

    #[test]
    fn test_superseded_write_takes_remote_value() {
        let mut store = store();
        store
            .ingest(snapshot(0, json!({"draft": {"title": "a", "body": "x"}})))
            .unwrap();
        store
            .stage("draft", json!({"title": "mine"}), PatchMode::Merge)
            .unwrap();
        assert_eq!(store.mirror()["draft"]["title"], "mine");

        let remote = json!({"title": "theirs", "body": "y"});
        store
            .ingest(patch(1, PatchDraft::replace("draft", remote.clone())))
            .unwrap();
        assert_eq!(store.mirror()["draft"], remote);
        assert_eq!(store.pending().count(), 0);
    }

    #[test]
    fn test_rejected_write_rolls_back() {
        let mut store = store();
        store.ingest(snapshot(0, json!({"input": "nyc"}))).unwrap();
        let cmd = store.stage("input", json!(42), PatchMode::Replace).unwrap();
        let outcome = store
            .ingest(SyncEvent::OverrideRejected {
                override_id: cmd.id.clone(),
                target_field: "input".into(),
                error: (&SyncError::validation("input", "expected string")).into(),
            })
            .unwrap();
        assert!(matches!(outcome, Ingest::Rejected { .. }));
        assert_eq!(store.mirror()["input"], "nyc");
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut store = store();
        store.ingest(snapshot(0, json!({}))).unwrap();
        store
            .ingest(SyncEvent::Lifecycle {
                seq: 1,
                status: SessionStatus::Completed,
                error: None,
            })
            .unwrap();
        store.ingest(snapshot(1, json!({}))).unwrap();
        assert_eq!(store.status(), SessionStatus::Completed);
        assert!(store.stage("x", json!(1), PatchMode::Replace).is_err());
    }

    #[test]
    fn test_change_notifications() {
        let mut store = store();
        let rx = store.changes();
        store.ingest(snapshot(0, json!({"a": 1, "b": 2}))).unwrap();
        store.ingest(patch(1, PatchDraft::replace("b", json!(3)))).unwrap();
        let change = rx.borrow().clone();
        assert_eq!(change.version, 2);
        assert_eq!(change.seq, 1);
        assert_eq!(change.changed_fields, vec!["b".to_string()]);
    }
}
