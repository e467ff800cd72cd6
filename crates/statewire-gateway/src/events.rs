//! Frame encoding for the WebSocket surface.

use tracing::error;

use statewire_core::error::Result;
use statewire_core::protocol::{ClientFrame, SyncEvent};

/// Serialize a server event, logging (and skipping) the rare failure.
pub fn encode_event(event: &SyncEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            error!(%e, kind = event.kind(), "Failed to serialize event");
            None
        }
    }
}

pub fn decode_client_frame(text: &str) -> Result<ClientFrame> {
    Ok(serde_json::from_str(text)?)
}
