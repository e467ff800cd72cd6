//! WebSocket transport to a statewire gateway.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use statewire_core::error::{Result, SyncError};
use statewire_core::protocol::{ClientFrame, OverrideCommand, SyncEvent};
use statewire_core::session::SessionId;
use statewire_core::transport::EventSource;

/// Close reason the gateway uses when it drops a slow subscriber.
pub const OVERFLOW_CLOSE_REASON: &str = "overflow";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    url: String,
    socket: Option<Socket>,
}

/// Subscription URL for `session` on a gateway at `base` (e.g. `ws://127.0.0.1:18790`).
pub fn session_url(base: &str, session: &SessionId) -> String {
    format!("{}/sessions/{}/ws", base.trim_end_matches('/'), session)
}

async fn open(url: &str) -> Result<Socket> {
    let (socket, _) = connect_async(url)
        .await
        .map_err(|e| SyncError::Transport(format!("connect {url}: {e}")))?;
    info!(url, "Connected to gateway");
    Ok(socket)
}

impl WsTransport {
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let socket = open(&url).await?;
        Ok(Self {
            url,
            socket: Some(socket),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn send_frame(&mut self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| SyncError::Transport("not connected".into()))?;
        socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}

#[async_trait]
impl EventSource for WsTransport {
    async fn next_event(&mut self) -> Result<Option<SyncEvent>> {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(None);
            };
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(serde_json::from_str(text.as_str())?)),
                Some(Ok(Message::Close(frame))) => {
                    self.socket = None;
                    let overflowed = frame
                        .as_ref()
                        .is_some_and(|f| f.reason.as_str() == OVERFLOW_CLOSE_REASON);
                    if overflowed {
                        warn!(url = %self.url, "Gateway dropped this subscriber for overflow");
                        return Err(SyncError::ChannelOverflow {
                            subscriber: self.url.clone(),
                            watermark: 0,
                        });
                    }
                    debug!(url = %self.url, ?frame, "Gateway closed the subscription");
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(SyncError::Transport(e.to_string()));
                }
                None => {
                    self.socket = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn send_override(&mut self, command: OverrideCommand) -> Result<()> {
        self.send_frame(&ClientFrame::Override(command)).await
    }

    /// Ask for a fresh snapshot, reconnecting if the gateway hung up.
    async fn resync(&mut self) -> Result<()> {
        if self.socket.is_some() {
            self.send_frame(&ClientFrame::Resync).await
        } else {
            self.socket = Some(open(&self.url).await?);
            Ok(())
        }
    }
}
