//! Per-session transport channel.
//!
//! Fans sequenced events out to every attached subscriber through a bounded
//! queue per subscriber. A subscriber whose queue reaches the watermark is
//! dropped and has to resynchronize from a fresh snapshot. Subscribers that
//! attach late get a snapshot of the latest canonical view first; the view
//! and the subscriber list share one lock so nothing published in between
//! can be missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use statewire_agent::{CanonicalView, EventSink, OverrideEnvelope};
use statewire_core::error::{Result, SyncError};
use statewire_core::protocol::{ErrorShape, OverrideCommand, SyncEvent};
use statewire_core::session::{SessionId, SessionStatus};
use statewire_core::state::StateContainer;
use statewire_core::transport::EventSource;

struct SubscriberSlot {
    tx: mpsc::Sender<SyncEvent>,
    overflowed: Arc<AtomicBool>,
}

struct ChannelInner {
    view: CanonicalView,
    subscribers: HashMap<String, SubscriberSlot>,
    closed: bool,
    updated_at: DateTime<Utc>,
}

pub struct SessionChannel {
    session_id: SessionId,
    watermark: usize,
    inner: Mutex<ChannelInner>,
    overrides: Mutex<Option<mpsc::Sender<OverrideEnvelope>>>,
}

fn snapshot_of(view: &CanonicalView) -> SyncEvent {
    SyncEvent::Snapshot {
        seq: view.seq,
        payload: view.state.to_value(),
        status: view.status,
    }
}

impl SessionChannel {
    pub fn new(session_id: SessionId, watermark: usize) -> Self {
        Self {
            session_id,
            watermark: watermark.max(1),
            inner: Mutex::new(ChannelInner {
                view: CanonicalView {
                    seq: 0,
                    status: SessionStatus::Initializing,
                    state: Arc::new(StateContainer::new()),
                },
                subscribers: HashMap::new(),
                closed: false,
                updated_at: Utc::now(),
            }),
            overrides: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        // Critical sections never panic midway; recover the guard if one did.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route override commands from subscribers to the session's runner.
    pub fn attach_overrides(&self, tx: mpsc::Sender<OverrideEnvelope>) {
        *self.overrides.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
    }

    /// Latest canonical view the channel has seen.
    pub fn view(&self) -> CanonicalView {
        self.lock().view.clone()
    }

    pub fn snapshot(&self) -> SyncEvent {
        snapshot_of(&self.lock().view)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.lock().updated_at
    }

    /// Register a fresh queue for `id`, primed with a snapshot of the current
    /// view. On a closed channel the queue gets the snapshot and then ends.
    fn register(&self, id: &str) -> (mpsc::Receiver<SyncEvent>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(self.watermark + 1);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut inner = self.lock();
        // Cannot fail: the queue is new and has room for the snapshot.
        let _ = tx.try_send(snapshot_of(&inner.view));
        if !inner.closed {
            inner.subscribers.insert(
                id.to_string(),
                SubscriberSlot {
                    tx,
                    overflowed: overflowed.clone(),
                },
            );
        }
        (rx, overflowed)
    }

    /// Attach a new subscriber. Its first event is always a snapshot.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (rx, overflowed) = self.register(&id);
        info!(session = %self.session_id, subscriber = %id, "Subscriber attached");
        #[cfg(feature = "metrics")]
        crate::metrics::record_subscribe();
        Subscription {
            id,
            channel: Arc::clone(self),
            rx,
            overflowed,
        }
    }

    fn detach(&self, id: &str) {
        if self.lock().subscribers.remove(id).is_some() {
            debug!(session = %self.session_id, subscriber = %id, "Subscriber detached");
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_unsubscribe();
    }

    /// Queue `event` for one slot; false means the slot must be dropped.
    fn offer(&self, id: &str, slot: &SubscriberSlot, event: SyncEvent) -> bool {
        match slot.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    session = %self.session_id,
                    subscriber = %id,
                    watermark = self.watermark,
                    "Subscriber exceeded buffer watermark, dropping"
                );
                slot.overflowed.store(true, Ordering::SeqCst);
                #[cfg(feature = "metrics")]
                crate::metrics::record_overflow();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl EventSink for SessionChannel {
    fn init(&self, view: CanonicalView) {
        let mut inner = self.lock();
        inner.view = view;
        inner.updated_at = Utc::now();
    }

    fn publish(&self, event: SyncEvent, view: CanonicalView) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(SyncError::SessionClosed(self.session_id.to_string()));
        }
        inner.view = view;
        inner.updated_at = Utc::now();

        let before = inner.subscribers.len();
        inner
            .subscribers
            .retain(|id, slot| self.offer(id, slot, event.clone()));
        debug!(
            session = %self.session_id,
            seq = ?event.seq(),
            kind = event.kind(),
            delivered = inner.subscribers.len(),
            dropped = before - inner.subscribers.len(),
            "Published event"
        );
        #[cfg(feature = "metrics")]
        {
            crate::metrics::record_event(event.kind());
            if matches!(&event, SyncEvent::Patch(patch) if patch.origin.is_some()) {
                crate::metrics::record_override_accepted();
            }
        }
        Ok(())
    }

    fn send_to(&self, subscriber: &str, event: SyncEvent) {
        #[cfg(feature = "metrics")]
        if let SyncEvent::OverrideRejected { error, .. } = &event {
            crate::metrics::record_override_rejected(&error.code);
        }
        let mut inner = self.lock();
        let keep = match inner.subscribers.get(subscriber) {
            Some(slot) => self.offer(subscriber, slot, event),
            None => {
                debug!(session = %self.session_id, subscriber, "Direct event for detached subscriber");
                return;
            }
        };
        if !keep {
            inner.subscribers.remove(subscriber);
        }
    }

    fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        // Dropping the senders lets each receiver drain what is queued, then end.
        let flushed = inner.subscribers.len();
        inner.subscribers.clear();
        info!(session = %self.session_id, subscribers = flushed, "Channel closed");
    }
}

/// One subscriber's view of a [`SessionChannel`].
pub struct Subscription {
    id: String,
    channel: Arc<SessionChannel>,
    rx: mpsc::Receiver<SyncEvent>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        self.channel.session_id()
    }

    fn overflow_error(&self) -> SyncError {
        SyncError::ChannelOverflow {
            subscriber: self.id.clone(),
            watermark: self.channel.watermark,
        }
    }
}

#[async_trait]
impl EventSource for Subscription {
    async fn next_event(&mut self) -> Result<Option<SyncEvent>> {
        if self.overflowed.load(Ordering::SeqCst) {
            return Err(self.overflow_error());
        }
        let event = self.rx.recv().await;
        // Queued history is worthless once dropped; only a snapshot helps.
        if self.overflowed.load(Ordering::SeqCst) {
            return Err(self.overflow_error());
        }
        Ok(event)
    }

    /// Queue an override for the runner without waiting. A finished session
    /// refuses it outright; a full queue rejects it back to this subscriber.
    async fn send_override(&mut self, command: OverrideCommand) -> Result<()> {
        let closed = || SyncError::SessionClosed(self.channel.session_id.to_string());
        if self.channel.is_closed() {
            return Err(closed());
        }
        let tx = self
            .channel
            .overrides
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| SyncError::Transport("session accepts no overrides".into()))?;
        let envelope = OverrideEnvelope {
            subscriber: self.id.clone(),
            command,
        };
        match tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(closed()),
            Err(TrySendError::Full(envelope)) => {
                let err = SyncError::Transport("override queue is full".into());
                warn!(session = %self.channel.session_id, subscriber = %self.id, override_id = %envelope.command.id, "Override queue full");
                self.channel.send_to(
                    &self.id,
                    SyncEvent::OverrideRejected {
                        override_id: envelope.command.id,
                        target_field: envelope.command.target_field,
                        error: ErrorShape::from(&err),
                    },
                );
                Err(err)
            }
        }
    }

    async fn resync(&mut self) -> Result<()> {
        let (rx, overflowed) = self.channel.register(&self.id);
        self.rx = rx;
        self.overflowed = overflowed;
        info!(session = %self.channel.session_id, subscriber = %self.id, "Subscriber resynchronized");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.detach(&self.id);
    }
}
