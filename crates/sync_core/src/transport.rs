use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use reqwest::Client;
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use shared::{
    domain::{Message, RoomId, UserId},
    protocol::{ClientFrame, RemoteMessageRecord, ServerPush},
};

use crate::{assets::AssetCache, controller::SyncController};

/// Connection lifecycle and push events observed from the live channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    MessageReceived(RemoteMessageRecord),
}

/// Contract with the real-time channel. Reconnection itself belongs to the
/// transport implementation; this engine only reacts to the transitions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, auth_token: &str) -> Result<()>;
    async fn join(&self, room_id: &RoomId) -> Result<()>;
    async fn fetch_history(&self, room_id: &RoomId, limit: u32)
        -> Result<Vec<RemoteMessageRecord>>;
    /// Sends a message to the remote service. `Ok(true)` means acknowledged.
    async fn send_message(&self, message: &Message) -> Result<bool>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    async fn leave(&self, room_id: &RoomId) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Lifecycle notifications the facade consumes (flush-on-reconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

/// Drives a [`Transport`] for the active room: joins and re-fetches history
/// on every connected transition, ingests pushes with dedupe, and prefetches
/// referenced rich media. State flows through the controller only; the
/// session never touches the message list directly.
pub struct TransportSession {
    transport: Arc<dyn Transport>,
    controller: Arc<SyncController>,
    assets: Arc<AssetCache>,
    history_limit: u32,
    connected: AtomicBool,
    room: Mutex<Option<RoomId>>,
    events: broadcast::Sender<SessionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        controller: Arc<SyncController>,
        assets: Arc<AssetCache>,
        history_limit: u32,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            transport,
            controller,
            assets,
            history_limit,
            connected: AtomicBool::new(false),
            room: Mutex::new(None),
            events,
            task: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Connects the transport and starts consuming its events.
    pub async fn start(self: &Arc<Self>, auth_token: &str) -> Result<()> {
        let mut receiver = self.transport.subscribe();
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                session.handle_event(event).await;
            }
        });

        {
            let mut guard = self.task.lock().await;
            if let Some(previous) = guard.replace(task) {
                previous.abort();
            }
        }

        self.transport.connect(auth_token).await
    }

    /// Selects the room this session mirrors. If already connected, joins
    /// and syncs history right away; otherwise the next connected
    /// transition picks it up.
    pub async fn set_room(&self, room_id: RoomId) {
        *self.room.lock().await = Some(room_id.clone());
        if self.is_connected() {
            self.join_and_sync(&room_id).await;
        }
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                // Re-join and re-fetch on every transition, not just the
                // first: the server may have dropped room membership.
                let room = self.room.lock().await.clone();
                if let Some(room_id) = room {
                    self.join_and_sync(&room_id).await;
                }
                let _ = self.events.send(SessionEvent::Connected);
            }
            TransportEvent::Disconnected => {
                self.connected.store(false, Ordering::SeqCst);
                let _ = self.events.send(SessionEvent::Disconnected);
            }
            TransportEvent::MessageReceived(record) => {
                let room = self.room.lock().await.clone();
                let Some(room_id) = room else {
                    return;
                };
                self.ingest(record, &room_id).await;
            }
        }
    }

    async fn join_and_sync(&self, room_id: &RoomId) {
        if let Err(err) = self.transport.join(room_id).await {
            warn!(room_id = %room_id, "room join failed: {err:#}");
            return;
        }

        match self.transport.fetch_history(room_id, self.history_limit).await {
            Ok(records) => {
                let current_user = self.controller.current_user().clone();
                let messages: Vec<Message> = records
                    .into_iter()
                    .map(|record| {
                        let message = record.into_message(room_id, &current_user);
                        self.prefetch_referenced_assets(&message);
                        message
                    })
                    .collect();
                info!(room_id = %room_id, count = messages.len(), "history synced");
                self.controller.merge_history(messages).await;
            }
            Err(err) => {
                warn!(room_id = %room_id, "history fetch failed: {err:#}");
            }
        }
    }

    async fn ingest(&self, record: RemoteMessageRecord, room_id: &RoomId) {
        let message = record.into_message(room_id, self.controller.current_user());
        self.prefetch_referenced_assets(&message);
        self.controller.ingest_remote(message).await;
    }

    fn prefetch_referenced_assets(&self, message: &Message) {
        if let Some(sticker_id) = message.kind.sticker_reference() {
            self.assets.prefetch(sticker_id.to_string());
        }
    }

    /// Best-effort teardown: tell the remote we left, then release the
    /// connection. Errors are swallowed.
    pub async fn stop(&self) {
        let room = self.room.lock().await.take();
        if let Some(room_id) = room {
            if let Err(err) = self.transport.leave(&room_id).await {
                warn!(room_id = %room_id, "room leave failed during teardown: {err}");
            }
        }
        if let Err(err) = self.transport.disconnect().await {
            warn!("disconnect failed during teardown: {err}");
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

/// Adapter that exposes the transport's outbound capability as the
/// controller's injected send function.
pub struct TransportSender {
    transport: Arc<dyn Transport>,
}

impl TransportSender {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl crate::controller::MessageSender for TransportSender {
    async fn send(&self, message: &Message) -> Result<bool> {
        self.transport.send_message(message).await
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// HTTP client with a bounded per-request wait, so a stalled server turns
/// into a failed attempt instead of an indefinite hang.
pub(crate) fn http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|err| {
        warn!("falling back to the default http client: {err}");
        Client::new()
    })
}

/// Live channel over a websocket, with history and outbound sends over the
/// service's HTTP API.
pub struct WsTransport {
    http: Client,
    server_url: String,
    current_user: UserId,
    events: broadcast::Sender<TransportEvent>,
    writer: Mutex<Option<WsSink>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(
        server_url: impl Into<String>,
        current_user: UserId,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            http: http_client(request_timeout),
            server_url: server_url.into(),
            current_user,
            events,
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
        })
    }

    fn ws_url(&self, auth_token: &str) -> Result<String> {
        let base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Ok(format!("{base}/ws?token={auth_token}"))
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| anyhow!("websocket is not connected"))?;
        let text = serde_json::to_string(frame)?;
        sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, auth_token: &str) -> Result<()> {
        let ws_url = self.ws_url(auth_token)?;
        let (stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (sink, mut reader) = stream.split();
        *self.writer.lock().await = Some(sink);

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerPush>(&text) {
                        Ok(ServerPush::MessageReceived { message }) => {
                            let _ = events.send(TransportEvent::MessageReceived(message));
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("discarding unparseable server frame: {err}");
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::Disconnected);
        });

        {
            let mut guard = self.reader_task.lock().await;
            if let Some(previous) = guard.replace(task) {
                previous.abort();
            }
        }

        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn join(&self, room_id: &RoomId) -> Result<()> {
        self.send_frame(&ClientFrame::JoinRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    async fn fetch_history(
        &self,
        room_id: &RoomId,
        limit: u32,
    ) -> Result<Vec<RemoteMessageRecord>> {
        let records: Vec<RemoteMessageRecord> = self
            .http
            .get(format!("{}/rooms/{}/messages", self.server_url, room_id))
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records)
    }

    async fn send_message(&self, message: &Message) -> Result<bool> {
        let response = self
            .http
            .post(format!(
                "{}/rooms/{}/messages",
                self.server_url, message.room_id
            ))
            .query(&[("sender", self.current_user.as_str())])
            .json(message)
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn leave(&self, room_id: &RoomId) -> Result<()> {
        self.send_frame(&ClientFrame::LeaveRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
