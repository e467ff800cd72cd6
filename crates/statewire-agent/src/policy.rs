//! Emission policy: maps a step's selected output to patch drafts.

use serde_json::{Value, json};
use tracing::debug;

use statewire_core::config::{EmissionConfig, EmitRule};
use statewire_core::patch::PatchDraft;
use statewire_core::state::StateContainer;

use crate::StepOutput;

/// Decides what to emit for a step output. Pure: never touches the container.
#[derive(Debug, Clone)]
pub struct EmissionPolicy {
    config: EmissionConfig,
    messages_field: String,
}

impl EmissionPolicy {
    pub fn new(config: EmissionConfig, messages_field: impl Into<String>) -> Self {
        Self {
            config,
            messages_field: messages_field.into(),
        }
    }

    pub fn messages_field(&self) -> &str {
        &self.messages_field
    }

    pub fn config(&self) -> &EmissionConfig {
        &self.config
    }

    /// Rules whose shape name matches exactly.
    fn rules_for<'a>(&'a self, shape: &'a str) -> impl Iterator<Item = &'a EmitRule> + 'a {
        self.config
            .emit_intermediate_state
            .iter()
            .filter(move |r| r.match_shape == shape)
    }

    /// Whether any rule routes outputs of `shape` into state.
    pub fn routes(&self, shape: &str) -> bool {
        self.rules_for(shape).next().is_some()
    }

    fn route(&self, shape: &str, value: &Value) -> Vec<PatchDraft> {
        self.rules_for(shape)
            .filter_map(|rule| {
                let payload = match &rule.argument {
                    None => value.clone(),
                    Some(arg) => match value.get(arg) {
                        Some(v) => v.clone(),
                        None => {
                            debug!(shape, argument = %arg, "Output lacks routed argument");
                            return None;
                        }
                    },
                };
                Some(PatchDraft::new(rule.target_field.clone(), payload, rule.mode))
            })
            .collect()
    }

    /// Patch drafts for one selected step output, given the current canonical state.
    pub fn evaluate(&self, output: &StepOutput, state: &StateContainer) -> Vec<PatchDraft> {
        match output {
            StepOutput::Text { role, content } => {
                if self.config.emit_messages {
                    vec![PatchDraft::append(
                        self.messages_field.clone(),
                        json!({ "role": role, "content": content }),
                    )]
                } else {
                    debug!("Message streaming disabled, text output not surfaced");
                    Vec::new()
                }
            }
            StepOutput::Structured { shape, value } => {
                let drafts = self.route(shape, value);
                if drafts.is_empty() {
                    debug!(shape = %shape, "No emission rule for shape");
                }
                drafts
            }
            StepOutput::ToolCall { name, arguments } => {
                let mut drafts = self.route(name, arguments);
                if self.config.emit_tool_calls {
                    drafts.push(PatchDraft::append(
                        self.messages_field.clone(),
                        json!({
                            "role": "assistant",
                            "tool_call": { "name": name, "arguments": arguments },
                        }),
                    ));
                }
                drafts
            }
            StepOutput::State { values } => state.diff(values),
            StepOutput::Empty => Vec::new(),
        }
    }
}
