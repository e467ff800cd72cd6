//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::patch::PatchMode;
use crate::shape::{ShapeRegistry, ShapeSchema};

/// Default reorder window, in events, on the client side.
pub const DEFAULT_REORDER_WINDOW: usize = 64;

/// Default per-subscriber buffer watermark, in events.
pub const DEFAULT_BUFFER_WATERMARK: usize = 256;

/// Default name of the append-only messages field.
pub const DEFAULT_MESSAGES_FIELD: &str = "messages";

/// Default seconds a finished session stays listed once its last subscriber leaves.
pub const DEFAULT_SESSION_RETENTION_SECS: u64 = 300;

/// Top-level statewire configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub emission: Option<EmissionConfig>,

    /// Structured output shapes known to the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shapes: Option<Vec<ShapeSchema>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Seconds a completed or errored session is kept for late subscribers.
    #[serde(default = "default_session_retention", alias = "sessionRetentionSecs")]
    pub session_retention_secs: u64,
}

fn default_session_retention() -> u64 {
    DEFAULT_SESSION_RETENTION_SECS
}

fn default_port() -> u16 {
    18790
}

/// Transport and mirror tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How many out-of-order events a client buffers before declaring a gap.
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,

    /// Events buffered per subscriber before it is dropped.
    #[serde(default = "default_buffer_watermark")]
    pub buffer_watermark: usize,

    /// Name of the append-only messages field.
    #[serde(default = "default_messages_field")]
    pub messages_field: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reorder_window: DEFAULT_REORDER_WINDOW,
            buffer_watermark: DEFAULT_BUFFER_WATERMARK,
            messages_field: DEFAULT_MESSAGES_FIELD.to_string(),
        }
    }
}

fn default_reorder_window() -> usize {
    DEFAULT_REORDER_WINDOW
}

fn default_buffer_watermark() -> usize {
    DEFAULT_BUFFER_WATERMARK
}

fn default_messages_field() -> String {
    DEFAULT_MESSAGES_FIELD.into()
}

/// What the backend emits, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionConfig {
    /// Stream conversational text as appends to the messages field.
    #[serde(default = "default_true", alias = "emitMessages")]
    pub emit_messages: bool,

    /// Also surface tool calls in the messages field.
    #[serde(default, alias = "emitToolCalls")]
    pub emit_tool_calls: bool,

    /// Route structured outputs by shape name into state fields.
    #[serde(default, alias = "emitIntermediateState")]
    pub emit_intermediate_state: Vec<EmitRule>,
}

impl Default for EmissionConfig {
    fn default() -> Self {
        Self {
            emit_messages: true,
            emit_tool_calls: false,
            emit_intermediate_state: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// "A step output of shape `match_shape` goes into `target_field`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitRule {
    #[serde(alias = "targetField")]
    pub target_field: String,
    #[serde(alias = "matchShape")]
    pub match_shape: String,
    /// Route only this top-level key of the output instead of the whole value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
    /// How the routed value is folded into the field.
    #[serde(default)]
    pub mode: PatchMode,
}

impl EmitRule {
    pub fn new(target_field: impl Into<String>, match_shape: impl Into<String>) -> Self {
        Self {
            target_field: target_field.into(),
            match_shape: match_shape.into(),
            argument: None,
            mode: PatchMode::Replace,
        }
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.argument = Some(argument.into());
        self
    }

    pub fn with_mode(mut self, mode: PatchMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "statewire_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| SyncError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5).
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Default config file path: `~/.statewire/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(18790)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn session_retention(&self) -> Duration {
        let secs = self
            .gateway
            .as_ref()
            .map(|g| g.session_retention_secs)
            .unwrap_or(DEFAULT_SESSION_RETENTION_SECS);
        Duration::from_secs(secs)
    }

    pub fn sync(&self) -> SyncConfig {
        self.sync.clone().unwrap_or_default()
    }

    pub fn reorder_window(&self) -> usize {
        self.sync
            .as_ref()
            .map(|s| s.reorder_window)
            .unwrap_or(DEFAULT_REORDER_WINDOW)
    }

    pub fn buffer_watermark(&self) -> usize {
        self.sync
            .as_ref()
            .map(|s| s.buffer_watermark)
            .unwrap_or(DEFAULT_BUFFER_WATERMARK)
    }

    pub fn messages_field(&self) -> &str {
        self.sync
            .as_ref()
            .map(|s| s.messages_field.as_str())
            .unwrap_or(DEFAULT_MESSAGES_FIELD)
    }

    pub fn emission(&self) -> EmissionConfig {
        self.emission.clone().unwrap_or_default()
    }

    /// Registry of the shapes declared in config.
    pub fn shape_registry(&self) -> ShapeRegistry {
        let mut registry = ShapeRegistry::new();
        for shape in self.shapes.iter().flatten() {
            registry.register(shape.clone());
        }
        registry
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "sync.reorder_window").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = match current {
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                other => other.get(segment)?,
            };
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(sync) = &self.sync {
            if sync.reorder_window == 0 {
                errors.push("sync.reorder_window must be at least 1".to_string());
            }
            if sync.buffer_watermark == 0 {
                errors.push("sync.buffer_watermark must be at least 1".to_string());
            }
            if sync.messages_field.is_empty() {
                errors.push("sync.messages_field cannot be empty".to_string());
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if let Some(emission) = &self.emission {
            let mut seen = std::collections::HashSet::new();
            for rule in &emission.emit_intermediate_state {
                if rule.target_field.is_empty() || rule.match_shape.is_empty() {
                    errors.push(format!(
                        "Emission rule needs both target_field and match_shape: {rule:?}"
                    ));
                    continue;
                }
                if !seen.insert((&rule.target_field, &rule.match_shape)) {
                    warnings.push(format!(
                        "Duplicate emission rule {} -> {}",
                        rule.match_shape, rule.target_field
                    ));
                }
                if let Some(shapes) = &self.shapes {
                    if !shapes.iter().any(|s| s.name == rule.match_shape) {
                        warnings.push(format!(
                            "Emission rule references undeclared shape '{}'",
                            rule.match_shape
                        ));
                    }
                }
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for statewire data: `~/.statewire/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".statewire")
}
