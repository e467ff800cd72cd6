//! Step runner: the single writer of a session's canonical state.
//!
//! Step completions and accepted overrides are serialized through one lock,
//! assigned the next sequence number, applied to the canonical container and
//! handed to the [`EventSink`] before the lock is released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use statewire_core::error::{Result, SyncError};
use statewire_core::patch::{PatchDraft, PatchMode};
use statewire_core::protocol::{ErrorShape, OverrideCommand, SyncEvent};
use statewire_core::session::{SessionId, SessionStatus};
use statewire_core::shape::ShapeRegistry;
use statewire_core::state::StateContainer;

use crate::policy::EmissionPolicy;
use crate::reconcile::reconcile;
use crate::{CanonicalView, EventSink, StepObserver, StepOutput, StepResult};

/// Pending client overrides queued per session.
const OVERRIDE_QUEUE_SIZE: usize = 256;

/// An override command and the subscriber that sent it.
#[derive(Debug, Clone)]
pub struct OverrideEnvelope {
    pub subscriber: String,
    pub command: OverrideCommand,
}

struct Canonical {
    state: Arc<StateContainer>,
    seq: u64,
    status: SessionStatus,
    /// Field -> (subscriber, base seq) of the override that last wrote it.
    chains: HashMap<String, (String, u64)>,
}

impl Canonical {
    fn view(&self) -> CanonicalView {
        CanonicalView {
            seq: self.seq,
            status: self.status,
            state: Arc::clone(&self.state),
        }
    }
}

pub struct StepRunner {
    session_id: SessionId,
    policy: EmissionPolicy,
    shapes: Arc<ShapeRegistry>,
    sink: Arc<dyn EventSink>,
    canonical: Mutex<Canonical>,
    overrides_tx: mpsc::Sender<OverrideEnvelope>,
    overrides_rx: Mutex<mpsc::Receiver<OverrideEnvelope>>,
}

impl StepRunner {
    /// Create a runner over `initial` state. The sink receives the starting
    /// view (sequence 0, `initializing`) immediately.
    pub fn new(
        session_id: SessionId,
        initial: StateContainer,
        policy: EmissionPolicy,
        shapes: Arc<ShapeRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let canonical = Canonical {
            state: Arc::new(initial),
            seq: 0,
            status: SessionStatus::Initializing,
            chains: HashMap::new(),
        };
        sink.init(canonical.view());
        let (overrides_tx, overrides_rx) = mpsc::channel(OVERRIDE_QUEUE_SIZE);
        Self {
            session_id,
            policy,
            shapes,
            sink,
            canonical: Mutex::new(canonical),
            overrides_tx,
            overrides_rx: Mutex::new(overrides_rx),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Handle for queueing client overrides; they are folded in at the next
    /// step boundary or while the session awaits input.
    pub fn override_sender(&self) -> mpsc::Sender<OverrideEnvelope> {
        self.overrides_tx.clone()
    }

    pub async fn view(&self) -> CanonicalView {
        self.canonical.lock().await.view()
    }

    pub async fn status(&self) -> SessionStatus {
        self.canonical.lock().await.status
    }

    fn apply_locked(
        &self,
        canonical: &mut Canonical,
        draft: &PatchDraft,
        origin: Option<&str>,
    ) -> Result<()> {
        // Validate before make_mut so a rejected draft never clones the state.
        canonical.state.validate(draft, &self.shapes)?;
        let seq = canonical.seq + 1;
        Arc::make_mut(&mut canonical.state).apply(draft, seq, &self.shapes)?;
        canonical.seq = seq;
        canonical.chains.remove(&draft.target_field);

        let mut event = draft.clone().sequenced(seq);
        if let Some(origin) = origin {
            event = event.with_origin(origin);
        }
        self.sink.publish(SyncEvent::Patch(event), canonical.view())
    }

    fn transition_locked(
        &self,
        canonical: &mut Canonical,
        next: SessionStatus,
        error: Option<ErrorShape>,
    ) -> Result<()> {
        if canonical.status == next {
            return Ok(());
        }
        if canonical.status.is_terminal() {
            return Err(SyncError::SessionClosed(self.session_id.to_string()));
        }
        if !canonical.status.can_transition_to(next) {
            return Err(anyhow!("illegal lifecycle move {} -> {}", canonical.status, next).into());
        }

        canonical.seq += 1;
        canonical.status = next;
        info!(session = %self.session_id, seq = canonical.seq, status = %next, "Session status changed");
        let published = self.sink.publish(
            SyncEvent::Lifecycle {
                seq: canonical.seq,
                status: next,
                error,
            },
            canonical.view(),
        );
        if next.is_terminal() {
            self.sink.close();
        }
        published
    }

    fn fail_locked(&self, canonical: &mut Canonical, err: &SyncError) -> Result<()> {
        error!(session = %self.session_id, code = err.code(), "Session failed: {err}");
        self.transition_locked(canonical, SessionStatus::Errored, Some(ErrorShape::from(err)))
    }

    /// Check a routed structured output or tool call against its registered shape.
    fn check_output(&self, output: &StepOutput) -> Result<()> {
        let (shape, value) = match output {
            StepOutput::Structured { shape, value } => (shape.as_str(), value),
            StepOutput::ToolCall { name, arguments } => (name.as_str(), arguments),
            _ => return Ok(()),
        };
        if !self.policy.routes(shape) || !self.shapes.contains(shape) {
            return Ok(());
        }
        self.shapes
            .check(shape, value)
            .map_err(|reason| SyncError::validation(shape, reason))
    }

    /// Apply one step output. Non-final outputs are speculative and dropped.
    ///
    /// An output that breaks its shape, or a draft the container refuses,
    /// fails the session: the error is published as an `errored` lifecycle
    /// event and returned. Other errors are returned as they are.
    pub async fn complete_step(&self, step_id: &str, output: StepOutput, is_final: bool) -> Result<()> {
        if !is_final {
            debug!(session = %self.session_id, step_id, kind = output.kind(), "Dropping non-final output");
            return Ok(());
        }

        let mut canonical = self.canonical.lock().await;
        if canonical.status.is_terminal() {
            return Err(SyncError::SessionClosed(self.session_id.to_string()));
        }
        if canonical.status == SessionStatus::Initializing {
            self.transition_locked(&mut canonical, SessionStatus::Running, None)?;
        }

        let applied = self.check_output(&output).and_then(|()| {
            let drafts = self.policy.evaluate(&output, &canonical.state);
            debug!(session = %self.session_id, step_id, drafts = drafts.len(), "Step complete");
            drafts
                .iter()
                .try_for_each(|draft| self.apply_locked(&mut canonical, draft, None))
        });
        if let Err(err) = applied {
            if err.is_terminal() {
                self.fail_locked(&mut canonical, &err)?;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Run one step of work against a snapshot of canonical state.
    ///
    /// Queued overrides are folded in first so the step sees them. The work
    /// runs without holding any lock; every candidate it returns is passed
    /// through [`StepRunner::complete_step`], with only the selected one final.
    pub async fn run_step<F, Fut>(&self, step_id: &str, work: F) -> Result<()>
    where
        F: FnOnce(Arc<StateContainer>) -> Fut,
        Fut: Future<Output = anyhow::Result<StepResult>>,
    {
        self.apply_overrides().await?;
        let state = self.view().await.state;

        let result = match work(state).await {
            Ok(result) => result,
            Err(e) => {
                let err = SyncError::Other(e);
                self.fail(&err).await?;
                return Err(err);
            }
        };

        for (i, output) in result.candidates.into_iter().enumerate() {
            let is_final = result.selected == Some(i);
            self.complete_step(step_id, output, is_final).await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        let mut canonical = self.canonical.lock().await;
        self.transition_locked(&mut canonical, SessionStatus::Running, None)
    }

    pub async fn await_input(&self) -> Result<()> {
        let mut canonical = self.canonical.lock().await;
        self.transition_locked(&mut canonical, SessionStatus::AwaitingInput, None)
    }

    pub async fn resume(&self) -> Result<()> {
        let mut canonical = self.canonical.lock().await;
        self.transition_locked(&mut canonical, SessionStatus::Running, None)
    }

    /// Mark the session completed; the sink is flushed and closed.
    pub async fn complete(&self) -> Result<()> {
        let mut canonical = self.canonical.lock().await;
        self.transition_locked(&mut canonical, SessionStatus::Completed, None)
    }

    /// Mark the session errored with `err`; the sink is flushed and closed.
    pub async fn fail(&self, err: &SyncError) -> Result<()> {
        let mut canonical = self.canonical.lock().await;
        self.fail_locked(&mut canonical, err)
    }

    /// Fold one queued override into canonical state. Rejections go back to
    /// the originating subscriber only.
    fn fold_override_locked(
        &self,
        canonical: &mut Canonical,
        envelope: OverrideEnvelope,
    ) -> Result<Option<OverrideCommand>> {
        let OverrideEnvelope { subscriber, command } = envelope;
        let verdict = if canonical.status.is_terminal() {
            Err(SyncError::SessionClosed(self.session_id.to_string()))
        } else {
            let chained_from = canonical
                .chains
                .get(&command.target_field)
                .filter(|(writer, _)| *writer == subscriber)
                .map(|(_, base)| *base);
            reconcile(&canonical.state, &command, chained_from, &self.shapes)
        };

        match verdict {
            Ok(draft) => {
                self.apply_locked(canonical, &draft, Some(&command.id))?;
                if command.mode != PatchMode::Append {
                    canonical
                        .chains
                        .insert(command.target_field.clone(), (subscriber, command.base_seq));
                }
                info!(
                    session = %self.session_id,
                    field = %command.target_field,
                    override_id = %command.id,
                    seq = canonical.seq,
                    "Override accepted"
                );
                Ok(Some(command))
            }
            Err(err) => {
                warn!(
                    session = %self.session_id,
                    field = %command.target_field,
                    override_id = %command.id,
                    code = err.code(),
                    "Override rejected"
                );
                self.sink.send_to(
                    &subscriber,
                    SyncEvent::OverrideRejected {
                        override_id: command.id,
                        target_field: command.target_field,
                        error: ErrorShape::from(&err),
                    },
                );
                Ok(None)
            }
        }
    }

    /// Fold every queued override into canonical state, returning the accepted ones.
    pub async fn apply_overrides(&self) -> Result<Vec<OverrideCommand>> {
        let mut rx = self.overrides_rx.lock().await;
        let mut canonical = self.canonical.lock().await;
        let mut accepted = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let Some(command) = self.fold_override_locked(&mut canonical, envelope)? {
                accepted.push(command);
            }
        }
        Ok(accepted)
    }

    /// Pause in `awaiting-input` until at least one override is accepted,
    /// then resume. Returns the accepted overrides.
    pub async fn wait_for_input(&self) -> Result<Vec<OverrideCommand>> {
        self.await_input().await?;

        let mut rx = self.overrides_rx.lock().await;
        let mut accepted = Vec::new();
        while accepted.is_empty() {
            let Some(envelope) = rx.recv().await else {
                return Err(SyncError::SessionClosed(self.session_id.to_string()));
            };
            let mut canonical = self.canonical.lock().await;
            if let Some(command) = self.fold_override_locked(&mut canonical, envelope)? {
                accepted.push(command);
            }
            while let Ok(envelope) = rx.try_recv() {
                if let Some(command) = self.fold_override_locked(&mut canonical, envelope)? {
                    accepted.push(command);
                }
            }
        }
        drop(rx);

        self.resume().await?;
        Ok(accepted)
    }
}

#[async_trait]
impl StepObserver for StepRunner {
    async fn on_step_complete(&self, step_id: &str, output: StepOutput, is_final: bool) -> Result<()> {
        self.complete_step(step_id, output, is_final).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use statewire_core::config::{EmissionConfig, EmitRule};
    use statewire_core::shape::{ShapeSchema, ValueType};
    use statewire_core::state::{FieldSpec, StateSchema};

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<SyncEvent>>,
        direct: std::sync::Mutex<Vec<(String, SyncEvent)>>,
        last_view: std::sync::Mutex<Option<CanonicalView>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<SyncEvent> {
            self.events.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl EventSink for RecordingSink {
        fn init(&self, view: CanonicalView) {
            *self.last_view.lock().unwrap() = Some(view);
        }

        fn publish(&self, event: SyncEvent, view: CanonicalView) -> Result<()> {
            if self.is_closed() {
                return Err(SyncError::SessionClosed("test".into()));
            }
            assert_eq!(event.seq(), Some(view.seq));
            self.events.lock().unwrap().push(event);
            *self.last_view.lock().unwrap() = Some(view);
            Ok(())
        }

        fn send_to(&self, subscriber: &str, event: SyncEvent) {
            self.direct.lock().unwrap().push((subscriber.to_string(), event));
        }

        fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn weather_shapes() -> ShapeRegistry {
        ShapeRegistry::new().with(
            ShapeSchema::new("WeatherResponse")
                .field("conditions", ValueType::String)
                .field("temperature", ValueType::Number)
                .field("wind_direction", ValueType::String)
                .field("wind_speed", ValueType::Number),
        )
    }

    fn weather_runner() -> (StepRunner, Arc<RecordingSink>) {
        let shapes = weather_shapes();
        let schema = StateSchema::new()
            .field(
                "final_response",
                FieldSpec::overwrite(ValueType::shape("WeatherResponse")),
                Value::Null,
            )
            .field("input", FieldSpec::overwrite(ValueType::String), json!("nyc"))
            .field("messages", FieldSpec::append_only(ValueType::Any), Value::Null);
        let state = StateContainer::from_schema(&schema, &shapes).unwrap();
        runner_over(state)
    }

    fn runner_over(state: StateContainer) -> (StepRunner, Arc<RecordingSink>) {
        let policy = EmissionPolicy::new(
            EmissionConfig {
                emit_messages: true,
                emit_tool_calls: false,
                emit_intermediate_state: vec![EmitRule::new("final_response", "WeatherResponse")],
            },
            "messages",
        );
        let sink = Arc::new(RecordingSink::default());
        let runner = StepRunner::new(
            SessionId::from("weather"),
            state,
            policy,
            Arc::new(weather_shapes()),
            sink.clone(),
        );
        (runner, sink)
    }

    fn weather() -> Value {
        json!({
            "conditions": "cloudy",
            "temperature": 70,
            "wind_direction": "NE",
            "wind_speed": 5
        })
    }

    #[tokio::test]
    async fn test_weather_scenario() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        runner
            .run_step("call_model", |state| async move {
                assert_eq!(state.get("input"), Some(&json!("nyc")));
                Ok(StepResult::single(StepOutput::structured("WeatherResponse", weather())))
            })
            .await
            .unwrap();
        runner.complete().await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            SyncEvent::Lifecycle { seq: 1, status: SessionStatus::Running, .. }
        ));
        match &events[1] {
            SyncEvent::Patch(p) => {
                assert_eq!(p.seq, 2);
                assert_eq!(p.target_field, "final_response");
                assert_eq!(p.mode, PatchMode::Replace);
                assert_eq!(p.payload, weather());
            }
            other => panic!("expected patch, got {other:?}"),
        }
        assert!(matches!(
            events[2],
            SyncEvent::Lifecycle { seq: 3, status: SessionStatus::Completed, .. }
        ));
        assert!(sink.is_closed());

        let view = runner.view().await;
        assert_eq!(view.state.get("final_response"), Some(&weather()));
        assert_eq!(view.state.get("input"), Some(&json!("nyc")));
    }

    #[tokio::test]
    async fn test_first_step_starts_session() {
        let (runner, sink) = weather_runner();
        runner
            .complete_step("s1", StepOutput::assistant("hello"), true)
            .await
            .unwrap();
        assert_eq!(runner.status().await, SessionStatus::Running);
        let kinds: Vec<_> = sink.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["lifecycle", "patch"]);
    }

    #[tokio::test]
    async fn test_speculative_outputs_are_dropped() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        runner
            .run_step("choose", |_| async move {
                Ok(StepResult::choose(
                    vec![StepOutput::assistant("draft one"), StepOutput::assistant("draft two")],
                    1,
                ))
            })
            .await
            .unwrap();

        let view = runner.view().await;
        assert_eq!(
            view.state.get("messages"),
            Some(&json!([{"role": "assistant", "content": "draft two"}]))
        );
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn test_validation_error_fails_session() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        let err = runner
            .complete_step(
                "bad",
                StepOutput::structured("WeatherResponse", json!({"conditions": "cloudy"})),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(runner.status().await, SessionStatus::Errored);
        assert!(sink.is_closed());

        match sink.events().last() {
            Some(SyncEvent::Lifecycle { status, error: Some(e), .. }) => {
                assert_eq!(*status, SessionStatus::Errored);
                assert_eq!(e.code, "validation_error");
            }
            other => panic!("expected errored lifecycle, got {other:?}"),
        }
        assert_eq!(runner.view().await.state.get("final_response"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_step_after_completion_is_refused() {
        let (runner, _sink) = weather_runner();
        runner.start().await.unwrap();
        runner.complete().await.unwrap();
        let err = runner
            .complete_step("late", StepOutput::assistant("too late"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_failed_work_fails_session() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        let err = runner
            .run_step("boom", |_| async move { Err(anyhow!("model unavailable")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model unavailable"));
        assert_eq!(runner.status().await, SessionStatus::Errored);
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_override_accepted_with_origin() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        let cmd = OverrideCommand::new("input", json!("sf"), PatchMode::Replace, 1);
        let id = cmd.id.clone();
        runner
            .override_sender()
            .send(OverrideEnvelope {
                subscriber: "ui-1".into(),
                command: cmd,
            })
            .await
            .unwrap();

        let accepted = runner.apply_overrides().await.unwrap();
        assert_eq!(accepted.len(), 1);
        match sink.events().last() {
            Some(SyncEvent::Patch(p)) => {
                assert_eq!(p.origin.as_deref(), Some(id.as_str()));
                assert_eq!(p.seq, 2);
            }
            other => panic!("expected patch, got {other:?}"),
        }
        assert_eq!(runner.view().await.state.get("input"), Some(&json!("sf")));
    }

    #[tokio::test]
    async fn test_stale_override_rejected_to_sender_only() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        runner
            .complete_step(
                "s1",
                StepOutput::structured("WeatherResponse", weather()),
                true,
            )
            .await
            .unwrap();

        let mut stale = weather();
        stale["conditions"] = json!("sunny");
        let cmd = OverrideCommand::new("final_response", stale, PatchMode::Replace, 1);
        runner
            .override_sender()
            .send(OverrideEnvelope {
                subscriber: "ui-2".into(),
                command: cmd.clone(),
            })
            .await
            .unwrap();

        let before = sink.events().len();
        assert!(runner.apply_overrides().await.unwrap().is_empty());
        assert_eq!(sink.events().len(), before);

        let direct = sink.direct.lock().unwrap().clone();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].0, "ui-2");
        match &direct[0].1 {
            SyncEvent::OverrideRejected { override_id, error, .. } => {
                assert_eq!(override_id, &cmd.id);
                assert_eq!(error.code, "conflict_override");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(runner.status().await, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_wait_for_input_round_trip() {
        let (runner, sink) = weather_runner();
        let runner = Arc::new(runner);
        runner.start().await.unwrap();

        let sender = runner.override_sender();
        let waiter = tokio::spawn({
            let runner = runner.clone();
            async move { runner.wait_for_input().await }
        });

        tokio::task::yield_now().await;
        sender
            .send(OverrideEnvelope {
                subscriber: "ui".into(),
                command: OverrideCommand::new("input", json!("boston"), PatchMode::Replace, 2),
            })
            .await
            .unwrap();

        let accepted = waiter.await.unwrap().unwrap();
        assert_eq!(accepted[0].payload, json!("boston"));
        assert_eq!(runner.status().await, SessionStatus::Running);

        let statuses: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::Lifecycle { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                SessionStatus::Running,
                SessionStatus::AwaitingInput,
                SessionStatus::Running
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_steps_get_contiguous_sequence() {
        let (runner, sink) = weather_runner();
        let runner = Arc::new(runner);
        runner.start().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let runner = runner.clone();
            handles.push(tokio::spawn(async move {
                runner
                    .complete_step(&format!("s{i}"), StepOutput::assistant(format!("m{i}")), true)
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let seqs: Vec<u64> = sink.events().iter().filter_map(|e| e.seq()).collect();
        assert_eq!(seqs, (1..=17).collect::<Vec<_>>());
        let messages = runner.view().await.state.get("messages").cloned().unwrap();
        assert_eq!(messages.as_array().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_structured_output_checked_against_shape_on_untyped_field() {
        let state = StateContainer::from_value(json!({"final_response": null, "input": "nyc"})).unwrap();
        let (runner, sink) = runner_over(state);
        runner.start().await.unwrap();

        let err = runner
            .complete_step(
                "bad",
                StepOutput::structured("WeatherResponse", json!({"bogus": true, "temperature": "hot"})),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref field, .. } if field == "WeatherResponse"));
        assert_eq!(runner.status().await, SessionStatus::Errored);
        assert!(sink.is_closed());
        assert_eq!(runner.view().await.state.get("final_response"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_unrouted_tool_call_is_not_shape_checked() {
        let (runner, _sink) = weather_runner();
        runner.start().await.unwrap();
        runner
            .complete_step(
                "search",
                StepOutput::ToolCall {
                    name: "search".into(),
                    arguments: json!({"query": "weather nyc"}),
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(runner.status().await, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_closed_sink_error_does_not_fail_session() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        sink.close();

        let err = runner
            .complete_step("s1", StepOutput::assistant("nobody listening"), true)
            .await
            .unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(runner.status().await, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_same_subscriber_writes_chain_on_one_field() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        let sender = runner.override_sender();
        for value in ["b", "bo"] {
            sender
                .send(OverrideEnvelope {
                    subscriber: "ui-1".into(),
                    command: OverrideCommand::new("input", json!(value), PatchMode::Replace, 1),
                })
                .await
                .unwrap();
        }

        let accepted = runner.apply_overrides().await.unwrap();
        assert_eq!(accepted.len(), 2);
        assert!(sink.direct.lock().unwrap().is_empty());
        assert_eq!(runner.view().await.state.get("input"), Some(&json!("bo")));
    }

    #[tokio::test]
    async fn test_chain_broken_by_step_write() {
        let (runner, sink) = weather_runner();
        runner.start().await.unwrap();
        let sender = runner.override_sender();
        let write = |value: &str| OverrideEnvelope {
            subscriber: "ui-1".into(),
            command: OverrideCommand::new("input", json!(value), PatchMode::Replace, 1),
        };

        sender.send(write("b")).await.unwrap();
        assert_eq!(runner.apply_overrides().await.unwrap().len(), 1);
        let values = json!({"input": "la"}).as_object().unwrap().clone();
        runner
            .complete_step("rewrite", StepOutput::State { values }, true)
            .await
            .unwrap();

        sender.send(write("bo")).await.unwrap();
        assert!(runner.apply_overrides().await.unwrap().is_empty());
        let direct = sink.direct.lock().unwrap().clone();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].0, "ui-1");
        assert_eq!(runner.view().await.state.get("input"), Some(&json!("la")));
    }
}
