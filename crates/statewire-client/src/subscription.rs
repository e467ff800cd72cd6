//! Subscription driver: pumps a transport into a [`ClientStore`].

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use statewire_core::error::{Result, SyncError};
use statewire_core::patch::PatchMode;
use statewire_core::session::SessionStatus;
use statewire_core::transport::EventSource;

use crate::store::{ClientStore, Ingest, MirrorChange};

pub struct ClientSubscription<T> {
    transport: T,
    store: ClientStore,
    resyncs: u64,
}

impl<T: EventSource> ClientSubscription<T> {
    pub fn new(transport: T, store: ClientStore) -> Self {
        Self {
            transport,
            store,
            resyncs: 0,
        }
    }

    pub fn current_mirror(&self) -> Value {
        self.store.current_mirror()
    }

    pub fn status(&self) -> SessionStatus {
        self.store.status()
    }

    pub fn changes(&self) -> watch::Receiver<MirrorChange> {
        self.store.changes()
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    /// How many times the subscription has had to fall back to a snapshot.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Replace `field` with `value` locally and send the write upstream.
    /// Returns the override id.
    pub async fn write(&mut self, field: &str, value: Value) -> Result<String> {
        self.write_with_mode(field, value, PatchMode::Replace).await
    }

    pub async fn write_with_mode(&mut self, field: &str, value: Value, mode: PatchMode) -> Result<String> {
        let command = self.store.stage(field, value, mode)?;
        let id = command.id.clone();
        self.transport.send_override(command).await?;
        Ok(id)
    }

    async fn resync(&mut self, reason: &SyncError) -> Result<()> {
        warn!(session = %self.store.session_id(), code = reason.code(), "Resynchronizing: {reason}");
        self.store.begin_resync();
        self.resyncs += 1;
        self.transport.resync().await
    }

    /// Process one event. Returns `None` once the transport has ended.
    ///
    /// Gaps and overflow are recovered here by requesting a fresh snapshot;
    /// they never reach the caller.
    pub async fn pump(&mut self) -> Result<Option<Ingest>> {
        match self.transport.next_event().await {
            Ok(Some(event)) => match self.store.ingest(event) {
                Ok(outcome) => Ok(Some(outcome)),
                Err(err @ SyncError::TransportGap { .. }) => {
                    self.resync(&err).await?;
                    Ok(Some(Ingest::Discarded))
                }
                Err(err) => Err(err),
            },
            Ok(None) => {
                debug!(session = %self.store.session_id(), "Transport ended");
                Ok(None)
            }
            Err(err @ SyncError::ChannelOverflow { .. }) => {
                self.resync(&err).await?;
                Ok(Some(Ingest::Discarded))
            }
            Err(err) => Err(err),
        }
    }

    /// Pump until the transport ends.
    pub async fn run(&mut self) -> Result<()> {
        while self.pump().await?.is_some() {}
        info!(session = %self.store.session_id(), status = %self.status(), seq = self.store.last_seq(), "Subscription finished");
        Ok(())
    }

    /// Pump until `done` holds for the store. Returns false if the transport
    /// ended first.
    pub async fn run_until(&mut self, mut done: impl FnMut(&ClientStore) -> bool) -> Result<bool> {
        while !done(&self.store) {
            if self.pump().await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn into_parts(self) -> (T, ClientStore) {
        (self.transport, self.store)
    }
}
