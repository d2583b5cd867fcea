use std::sync::Arc;

use anyhow::Result;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::info;

use shared::{
    domain::{Message, MessageId, OutgoingDraft, RoomId},
    error::SyncError,
};

use crate::{
    assets::AssetCache,
    controller::{MessagePatch, SyncController},
    resolver::{ChatHandle, ConversationResolver},
    transport::{SessionEvent, Transport, TransportSender, TransportSession},
};

/// Composes the sync controller, transport session and identity resolver
/// into the surface the UI layer talks to.
///
/// The controller needs a send function and the transport needs the
/// controller's current list for dedupe; the cycle is broken by installing
/// the transport-backed sender into the controller after both exist.
pub struct Messaging {
    controller: Arc<SyncController>,
    session: Arc<TransportSession>,
    resolver: Arc<ConversationResolver>,
    active_chat: Mutex<Option<ChatHandle>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Messaging {
    pub async fn new(
        controller: Arc<SyncController>,
        transport: Arc<dyn Transport>,
        resolver: Arc<ConversationResolver>,
        assets: Arc<AssetCache>,
        history_limit: u32,
    ) -> Arc<Self> {
        let session = TransportSession::new(
            Arc::clone(&transport),
            Arc::clone(&controller),
            assets,
            history_limit,
        );

        controller
            .set_sender(Arc::new(TransportSender::new(transport)))
            .await;

        let facade = Arc::new(Self {
            controller: Arc::clone(&controller),
            session: Arc::clone(&session),
            resolver,
            active_chat: Mutex::new(None),
            flush_task: Mutex::new(None),
        });

        // Every reconnect drains whatever queued up while offline.
        let mut events = session.subscribe();
        let flush_controller = controller;
        let task = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event == SessionEvent::Connected {
                    info!("transport connected, flushing queued messages");
                    flush_controller.flush_queue().await;
                }
            }
        });
        *facade.flush_task.lock().await = Some(task);

        facade
    }

    pub async fn connect(self: &Arc<Self>, auth_token: &str) -> Result<()> {
        self.session.start(auth_token).await
    }

    /// Opens a chat: the controller switches rooms immediately and the
    /// session mirrors the room on the live channel.
    pub async fn open_chat(&self, handle: ChatHandle) {
        let room_id = handle.room_id.clone();
        *self.active_chat.lock().await = Some(handle);
        self.controller.open_room(room_id.clone()).await;
        self.session.set_room(room_id).await;
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<Message, SyncError> {
        self.send_rich(OutgoingDraft::text(body)).await
    }

    /// Resolves conversation identity lazily, then hands the draft to the
    /// controller. A transient resolution failure sends local-only; the
    /// id is retried on the next send.
    pub async fn send_rich(&self, mut draft: OutgoingDraft) -> Result<Message, SyncError> {
        if draft.conversation_id.is_none() {
            let handle = self.active_chat.lock().await.clone();
            if let Some(handle) = handle {
                draft.conversation_id = self.resolver.resolve(&handle).await?;
            }
        }
        self.controller.send_rich(draft).await
    }

    pub async fn reply(
        &self,
        reply_to: MessageId,
        draft: OutgoingDraft,
    ) -> Result<Message, SyncError> {
        self.send_rich(OutgoingDraft {
            reply_to_id: Some(reply_to),
            ..draft
        })
        .await
    }

    pub async fn edit(&self, id: &MessageId, patch: MessagePatch) -> Result<Message, SyncError> {
        self.controller.edit(id, patch).await
    }

    pub async fn soft_delete(&self, id: &MessageId) -> Result<Message, SyncError> {
        self.controller.soft_delete(id).await
    }

    pub async fn flush_queue(&self) {
        self.controller.flush_queue().await;
    }

    /// Current message list for the open room, in display order.
    pub async fn messages(&self) -> Vec<Message> {
        self.controller.messages().await
    }

    pub async fn is_loading(&self) -> bool {
        self.controller.is_loading().await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub async fn active_room(&self) -> Option<RoomId> {
        self.controller.active_room().await
    }

    /// Best-effort teardown of the live channel.
    pub async fn close(&self) {
        self.session.stop().await;
        if let Some(task) = self.flush_task.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/facade_tests.rs"]
mod tests;
