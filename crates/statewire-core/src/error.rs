use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A patch payload does not conform to its target field's declared shape.
    #[error("Validation error on field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// A subscriber saw a sequence gap wider than its reorder window.
    #[error("Sequence gap: expected {expected}, received {received}")]
    TransportGap { expected: u64, received: u64 },

    /// A client override targeted state the canonical container has moved past.
    #[error("Override on '{field}' conflicts: based on seq {base_seq}, field last written at seq {current_seq}")]
    ConflictOverride {
        field: String,
        base_seq: u64,
        current_seq: u64,
    },

    /// A slow subscriber exceeded the buffering watermark and was disconnected.
    #[error("Subscriber {subscriber} exceeded buffer watermark of {watermark} events")]
    ChannelOverflow { subscriber: String, watermark: usize },

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unknown state field: {0}")]
    UnknownField(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable snake_case code used on the wire and as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::TransportGap { .. } => "transport_gap",
            Self::ConflictOverride { .. } => "conflict_override",
            Self::ChannelOverflow { .. } => "channel_overflow",
            Self::SessionClosed(_) => "session_closed",
            Self::UnknownSession(_) => "unknown_session",
            Self::UnknownField(_) => "unknown_field",
            Self::Config(_) => "config_error",
            Self::Transport(_) => "transport_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// Whether this error ends the session it occurred in.
    ///
    /// Only failures against the canonical container are terminal; everything
    /// local to one subscription is recoverable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::UnknownField(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
