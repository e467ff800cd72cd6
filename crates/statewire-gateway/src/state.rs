//! Gateway shared state: the registry of live sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use statewire_agent::{EmissionPolicy, StepRunner};
use statewire_core::config::Config;
use statewire_core::error::{Result, SyncError};
use statewire_core::session::{SessionId, SessionInfo};
use statewire_core::shape::{ShapeRegistry, ShapeSchema};
use statewire_core::state::StateContainer;

use crate::channel::SessionChannel;

/// A session hosted by the gateway.
#[derive(Clone)]
pub struct SessionEntry {
    pub runner: Arc<StepRunner>,
    pub channel: Arc<SessionChannel>,
    pub created_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn info(&self) -> SessionInfo {
        let view = self.channel.view();
        SessionInfo {
            id: self.channel.session_id().clone(),
            status: view.status,
            seq: view.seq,
            subscribers: self.channel.subscriber_count(),
            created_at: self.created_at,
            updated_at: self.channel.updated_at(),
        }
    }
}

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub shapes: Arc<ShapeRegistry>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>) -> Self {
        let shapes = Arc::new(config.shape_registry());
        Self {
            config,
            shapes,
            sessions: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Register a shape on top of those declared in config.
    pub fn with_shape(mut self, schema: ShapeSchema) -> Self {
        Arc::make_mut(&mut self.shapes).register(schema);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Open a session with a generated id and the configured emission policy.
    pub async fn create_session(&self, initial: StateContainer) -> Result<SessionEntry> {
        let policy = EmissionPolicy::new(self.config.emission(), self.config.messages_field());
        self.open_session(SessionId::new(), initial, policy).await
    }

    /// Open a session under `id`, wiring its runner to a fresh channel.
    pub async fn open_session(
        &self,
        id: SessionId,
        initial: StateContainer,
        policy: EmissionPolicy,
    ) -> Result<SessionEntry> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(anyhow!("session {id} already exists").into());
        }

        let channel = Arc::new(SessionChannel::new(id.clone(), self.config.buffer_watermark()));
        let runner = Arc::new(StepRunner::new(
            id.clone(),
            initial,
            policy,
            self.shapes.clone(),
            channel.clone(),
        ));
        channel.attach_overrides(runner.override_sender());

        let entry = SessionEntry {
            runner,
            channel,
            created_at: Utc::now(),
        };
        sessions.insert(id.clone(), entry.clone());
        info!(session = %id, "Session opened");
        Ok(entry)
    }

    pub async fn session(&self, id: &SessionId) -> Result<SessionEntry> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownSession(id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionEntry::info)
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Forget a session. Attached subscribers keep draining until its channel closes.
    pub async fn remove(&self, id: &SessionId) -> Option<SessionEntry> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            info!(session = %id, "Session removed");
        }
        removed
    }

    /// Forget completed or errored sessions idle for at least `retention`.
    /// Subscribers already attached keep their queues. Returns how many were removed.
    pub async fn reap_finished(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| {
                let idle = (now - entry.channel.updated_at()).to_std().unwrap_or_default();
                entry.channel.is_closed() && idle >= retention
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.remove(id).await;
        }
        if !expired.is_empty() {
            debug!(reaped = expired.len(), "Finished sessions reaped");
        }
        expired.len()
    }

    /// Reap finished sessions in the background for as long as the gateway runs.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let retention = state.config.session_retention();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                state.reap_finished(retention).await;
            }
        })
    }
}

/// How often the background reaper looks for finished sessions.
const REAP_INTERVAL: Duration = Duration::from_secs(30);
