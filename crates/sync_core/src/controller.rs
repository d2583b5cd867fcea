use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use shared::{
    domain::{
        Attachment, Message, MessageId, MessageKind, MessageStatus, OutgoingDraft, RoomId, UserId,
    },
    error::SyncError,
};
use storage::MessageStore;

/// Bounded retry policy for the flush queue. A message that exhausts its
/// attempts parks in `failed` until the user edits or deletes it, which
/// resets the counter.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub max_send_attempts: u32,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_send_attempts: 20,
        }
    }
}

/// Injected network-send capability. `Ok(true)` means the remote service
/// acknowledged the message.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &Message) -> Result<bool>;
}

/// Fields merged into an existing message by [`SyncController::edit`].
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub kind: Option<MessageKind>,
    pub attachments: Option<Vec<Attachment>>,
    pub is_pinned: Option<bool>,
    pub is_starred: Option<bool>,
}

impl MessagePatch {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: Some(MessageKind::Text { body: body.into() }),
            ..Self::default()
        }
    }
}

struct RoomState {
    room_id: Option<RoomId>,
    generation: u64,
    messages: Vec<Message>,
    loading: bool,
}

/// Owns the in-memory authoritative message list for the active room and
/// drives the optimistic send/retry/edit/delete state machine. The store is
/// only ever written through this controller while a room is open.
pub struct SyncController {
    store: MessageStore,
    current_user: UserId,
    policy: FlushPolicy,
    sender: RwLock<Option<Arc<dyn MessageSender>>>,
    inner: Mutex<RoomState>,
}

impl SyncController {
    pub fn new(store: MessageStore, current_user: UserId) -> Arc<Self> {
        Self::with_policy(store, current_user, FlushPolicy::default())
    }

    pub fn with_policy(
        store: MessageStore,
        current_user: UserId,
        policy: FlushPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            current_user,
            policy,
            sender: RwLock::new(None),
            inner: Mutex::new(RoomState {
                room_id: None,
                generation: 0,
                messages: Vec::new(),
                loading: false,
            }),
        })
    }

    /// Installs the network-send function after construction. Until this is
    /// called, composed messages stay `pending` and flush is a no-op.
    pub async fn set_sender(&self, sender: Arc<dyn MessageSender>) {
        *self.sender.write().await = Some(sender);
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    /// Switches the active room. In-memory state clears immediately so the
    /// previous room's messages never bleed into the new view; the durable
    /// copy then loads asynchronously. A load that resolves after another
    /// room switch is discarded.
    pub async fn open_room(&self, room_id: RoomId) {
        let generation = {
            let mut state = self.inner.lock().await;
            state.messages.clear();
            state.room_id = Some(room_id.clone());
            state.generation += 1;
            state.loading = true;
            state.generation
        };

        let mut loaded = self.store.load(&room_id).await;
        sort_by_timestamp(&mut loaded);

        let mut state = self.inner.lock().await;
        if state.generation != generation {
            // The room changed while the load was in flight.
            return;
        }
        state.messages = loaded;
        state.loading = false;
    }

    pub async fn active_room(&self) -> Option<RoomId> {
        self.inner.lock().await.room_id.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.lock().await.loading
    }

    /// Snapshot of the active room's messages in display order.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    /// Composes and sends a message. The draft is appended and persisted
    /// before any network attempt, so it survives a crash or disconnect.
    /// Network failure leaves it `pending` for the flush path; it is never
    /// surfaced as an error.
    pub async fn send_rich(&self, draft: OutgoingDraft) -> Result<Message, SyncError> {
        if draft.is_blank() {
            return Err(SyncError::EmptyMessage);
        }

        let message = {
            let mut state = self.inner.lock().await;
            let room_id = state.room_id.clone().ok_or(SyncError::NoActiveRoom)?;

            let kind = draft
                .kind
                .unwrap_or(MessageKind::Text { body: String::new() });
            let mut message = Message::draft(room_id.clone(), self.current_user.clone(), kind);
            message.attachments = draft.attachments;
            message.reply_to_id = draft.reply_to_id;
            message.conversation_id = draft.conversation_id;

            state.messages.push(message.clone());
            sort_by_timestamp(&mut state.messages);
            self.store.save(&room_id, &state.messages).await;
            message
        };

        let sender = self.sender.read().await.clone();
        let Some(sender) = sender else {
            info!(message_id = %message.id, "no sender configured, message stays pending");
            return Ok(message);
        };

        let acked = match sender.send(&message).await {
            Ok(acked) => acked,
            Err(err) => {
                warn!(message_id = %message.id, "send failed, message stays pending: {err:#}");
                false
            }
        };

        if !acked {
            return Ok(message);
        }

        let mut state = self.inner.lock().await;
        let room_id = state.room_id.clone();
        if let Some(stored) = state.messages.iter_mut().find(|m| m.id == message.id) {
            stored.apply_status(MessageStatus::Sent);
            let sent = stored.clone();
            if let Some(room_id) = room_id {
                self.store.upsert(&room_id, &sent).await;
            }
            return Ok(sent);
        }
        Ok(message)
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<Message, SyncError> {
        self.send_rich(OutgoingDraft::text(body)).await
    }

    /// Convenience wrapper over send that stamps the reply reference.
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

    /// Merges a patch into the message and marks it for re-propagation.
    /// Editing re-arms delivery even for a message that exhausted its
    /// retries.
    pub async fn edit(&self, id: &MessageId, patch: MessagePatch) -> Result<Message, SyncError> {
        let mut state = self.inner.lock().await;
        let room_id = state.room_id.clone().ok_or(SyncError::NoActiveRoom)?;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == *id)
            .ok_or_else(|| SyncError::UnknownMessage(id.to_string()))?;

        if let Some(kind) = patch.kind {
            message.kind = kind;
        }
        if let Some(attachments) = patch.attachments {
            message.attachments = attachments;
        }
        if let Some(pinned) = patch.is_pinned {
            message.is_pinned = pinned;
        }
        if let Some(starred) = patch.is_starred {
            message.is_starred = starred;
        }
        message.is_edited = true;
        message.updated_at = Some(Utc::now());
        // An edit is a new sync-able event: status resets regardless of the
        // forward-only ladder, and the retry budget starts over.
        message.status = MessageStatus::Pending;
        message.send_attempts = 0;

        let edited = message.clone();
        self.store.upsert(&room_id, &edited).await;
        Ok(edited)
    }

    /// Soft delete: content is cleared but the entity survives so ordering
    /// and reply references stay valid. The deletion itself must propagate,
    /// so the status drops back to `pending`.
    pub async fn soft_delete(&self, id: &MessageId) -> Result<Message, SyncError> {
        let mut state = self.inner.lock().await;
        let room_id = state.room_id.clone().ok_or(SyncError::NoActiveRoom)?;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == *id)
            .ok_or_else(|| SyncError::UnknownMessage(id.to_string()))?;

        message.redact();
        message.status = MessageStatus::Pending;
        message.send_attempts = 0;

        let deleted = message.clone();
        self.store.upsert(&room_id, &deleted).await;
        Ok(deleted)
    }

    /// Re-attempts delivery for every `pending`/`failed` message, in display
    /// order, one at a time so server-side ordering tracks client send
    /// order. Persists the batch once at the end. Idempotent: `sent`
    /// messages and messages past their retry budget are untouched.
    pub async fn flush_queue(&self) {
        let sender = self.sender.read().await.clone();
        let Some(sender) = sender else {
            return;
        };

        let mut state = self.inner.lock().await;
        let Some(room_id) = state.room_id.clone() else {
            return;
        };

        let mut dirty = false;
        for index in 0..state.messages.len() {
            let message = &state.messages[index];
            if !message.status.needs_send()
                || message.send_attempts >= self.policy.max_send_attempts
            {
                continue;
            }

            let attempt = {
                let message = &mut state.messages[index];
                message.status = MessageStatus::Sending;
                message.clone()
            };

            let outcome = sender.send(&attempt).await;
            let message = &mut state.messages[index];
            match outcome {
                Ok(true) => {
                    message.status = MessageStatus::Sent;
                }
                Ok(false) => {
                    message.send_attempts += 1;
                    message.status = MessageStatus::Failed;
                }
                Err(err) => {
                    message.send_attempts += 1;
                    message.status = MessageStatus::Failed;
                    warn!(message_id = %message.id, "flush send failed: {err:#}");
                }
            }
            if message.send_attempts >= self.policy.max_send_attempts {
                warn!(
                    message_id = %message.id,
                    attempts = message.send_attempts,
                    "message exhausted its retry budget"
                );
            }
            dirty = true;
        }

        if dirty {
            self.store.save(&room_id, &state.messages).await;
        }
    }

    /// Wholesale overwrite with an authoritative remote history or merged
    /// state. Bypasses the send state machine.
    pub async fn replace_messages(&self, mut messages: Vec<Message>) {
        let mut state = self.inner.lock().await;
        let Some(room_id) = state.room_id.clone() else {
            return;
        };
        sort_by_timestamp(&mut messages);
        state.messages = messages;
        state.loading = false;
        self.store.save(&room_id, &state.messages).await;
    }

    /// Reconciles a fetched history with the current room. The server copy
    /// wins for everything it knows about (matched by id or client id), but
    /// local messages the server has not seen yet survive: anything still
    /// carrying a temporary id or still owed a send stays in the room so a
    /// reconnect cannot drop the offline queue.
    pub async fn merge_history(&self, mut incoming: Vec<Message>) {
        let mut state = self.inner.lock().await;
        let Some(room_id) = state.room_id.clone() else {
            return;
        };

        let locals = std::mem::take(&mut state.messages);
        for local in locals {
            let known_remotely = incoming.iter().any(|remote| {
                remote.id == local.id
                    || (!local.client_id.is_empty() && remote.client_id == local.client_id)
            });
            if known_remotely {
                continue;
            }
            if local.id.is_local()
                || local.status.needs_send()
                || local.status == MessageStatus::Sending
            {
                incoming.push(local);
            }
        }

        sort_by_timestamp(&mut incoming);
        state.messages = incoming;
        state.loading = false;
        self.store.save(&room_id, &state.messages).await;
    }

    /// Ingests a push-delivered message. Duplicates are suppressed by `id`
    /// or by non-empty `client_id`; the client-id path is how a local send
    /// reconciles with its server echo, adopting the server id and moving
    /// to `sent`. Returns whether the room changed.
    pub async fn ingest_remote(&self, incoming: Message) -> bool {
        let mut state = self.inner.lock().await;
        let Some(room_id) = state.room_id.clone() else {
            return false;
        };

        if state.messages.iter().any(|m| m.id == incoming.id) {
            return false;
        }

        let echo_index = if incoming.client_id.is_empty() {
            None
        } else {
            state
                .messages
                .iter()
                .position(|m| m.client_id == incoming.client_id)
        };

        if let Some(index) = echo_index {
            let local = &mut state.messages[index];
            info!(
                local_id = %local.id,
                server_id = %incoming.id,
                "correlated local message with its server echo"
            );
            local.id = incoming.id;
            if local.conversation_id.is_none() {
                local.conversation_id = incoming.conversation_id;
            }
            local.apply_status(MessageStatus::Sent);
            // The id changed, so the old row has to go: rewrite the room.
            self.store.save(&room_id, &state.messages).await;
            return true;
        }

        state.messages.push(incoming.clone());
        sort_by_timestamp(&mut state.messages);
        self.store.upsert(&room_id, &incoming).await;
        true
    }
}

/// Canonical display order: `created_at` ascending, ties keep their current
/// relative order (stable sort).
fn sort_by_timestamp(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
