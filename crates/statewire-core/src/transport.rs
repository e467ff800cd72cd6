//! Subscriber-side view of a transport channel.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{OverrideCommand, SyncEvent};

/// One subscriber's end of a session's event stream.
///
/// Implemented by the in-process gateway subscription and by the WebSocket
/// client transport.
#[async_trait]
pub trait EventSource: Send {
    /// Next event for this subscriber.
    ///
    /// Returns `Ok(None)` once the session has closed and everything buffered
    /// has been delivered, and `Err(SyncError::ChannelOverflow)` if this
    /// subscriber was dropped for falling behind.
    async fn next_event(&mut self) -> Result<Option<SyncEvent>>;

    /// Send an override upstream. Overrides from one subscriber stay in order.
    async fn send_override(&mut self, command: OverrideCommand) -> Result<()>;

    /// Obtain a fresh snapshot, reattaching if the subscriber was dropped.
    /// The next sequenced event delivered afterwards is a snapshot.
    async fn resync(&mut self) -> Result<()>;
}
