//! Backend side of statewire: turns completed workflow steps into sequenced
//! state patches.
//!
//! The [`EmissionPolicy`] decides what a step output means for shared state,
//! the [`StepRunner`] applies the resulting patches to the canonical container
//! and hands them to an [`EventSink`] (normally the gateway's transport
//! channel), and [`reconcile`] decides whether client overrides are accepted.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use statewire_core::error::Result;
use statewire_core::protocol::SyncEvent;
use statewire_core::session::SessionStatus;
use statewire_core::state::StateContainer;

pub mod policy;
pub mod reconcile;
pub mod runner;

pub use policy::EmissionPolicy;
pub use reconcile::reconcile;
pub use runner::{OverrideEnvelope, StepRunner};

/// What one unit of backend work produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    /// Conversational text.
    Text { role: String, content: String },

    /// A value of a declared shape, e.g. the arguments of a `WeatherResponse` tool.
    Structured { shape: String, value: Value },

    /// A tool invocation the step decided on.
    ToolCall { name: String, arguments: Value },

    /// A partial state map, as returned by a graph node.
    State { values: Map<String, Value> },

    /// Nothing to surface.
    Empty,
}

impl StepOutput {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Text {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn structured(shape: impl Into<String>, value: Value) -> Self {
        Self::Structured {
            shape: shape.into(),
            value,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Structured { .. } => "structured",
            Self::ToolCall { .. } => "tool_call",
            Self::State { .. } => "state",
            Self::Empty => "empty",
        }
    }
}

/// All outputs a step considered, and which one it settled on.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub candidates: Vec<StepOutput>,
    pub selected: Option<usize>,
}

impl StepResult {
    /// A step with exactly one, selected, output.
    pub fn single(output: StepOutput) -> Self {
        Self {
            candidates: vec![output],
            selected: Some(0),
        }
    }

    /// A step that weighed several outputs and chose `selected`.
    pub fn choose(candidates: Vec<StepOutput>, selected: usize) -> Self {
        Self {
            candidates,
            selected: Some(selected),
        }
    }

    pub fn selected_output(&self) -> Option<&StepOutput> {
        self.selected.and_then(|i| self.candidates.get(i))
    }
}

/// Hook the external workflow engine calls after each step.
#[async_trait]
pub trait StepObserver: Send + Sync {
    /// `is_final` marks the output the step settled on; anything else is
    /// speculative and must not reach subscribers.
    async fn on_step_complete(&self, step_id: &str, output: StepOutput, is_final: bool)
    -> Result<()>;
}

/// Canonical state as of a given sequence number.
#[derive(Debug, Clone)]
pub struct CanonicalView {
    pub seq: u64,
    pub status: SessionStatus,
    pub state: Arc<StateContainer>,
}

/// Where the runner delivers sequenced events.
///
/// Implementations must not block: publishing happens while the canonical
/// container is held.
pub trait EventSink: Send + Sync {
    /// Install the starting view, before any event is published.
    fn init(&self, view: CanonicalView);

    /// Deliver a sequenced event to every subscriber; `view` is the canonical
    /// state with the event applied.
    fn publish(&self, event: SyncEvent, view: CanonicalView) -> Result<()>;

    /// Deliver an unsequenced event to one subscriber only.
    fn send_to(&self, subscriber: &str, event: SyncEvent);

    /// Flush and stop accepting events.
    fn close(&self);
}
