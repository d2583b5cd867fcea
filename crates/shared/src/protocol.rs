use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Attachment, ClientId, ConversationId, Message, MessageId, MessageKind, MessageStatus, RoomId,
    UserId,
};

/// A message record as delivered by the remote service, either from a history
/// fetch or a live push. Field names vary between service versions, so every
/// field is aliased and optional; [`RemoteMessageRecord::into_message`] fills
/// defaults rather than rejecting the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteMessageRecord {
    #[serde(default, alias = "messageId", alias = "_id")]
    pub id: Option<String>,
    #[serde(default, alias = "clientId", alias = "localId")]
    pub client_id: Option<String>,
    #[serde(default, alias = "conversationId", alias = "conversation")]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "senderId", alias = "from")]
    pub sender_id: Option<String>,
    #[serde(default, alias = "createdAt", alias = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kind: Option<RemoteKindTag>,
    #[serde(default, alias = "text", alias = "body")]
    pub text: Option<String>,
    #[serde(default, alias = "stickerId", alias = "sticker")]
    pub sticker_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, alias = "replyTo", alias = "replyToId")]
    pub reply_to_id: Option<String>,
    #[serde(default, alias = "isEdited")]
    pub is_edited: bool,
    #[serde(default, alias = "isDeleted")]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKindTag {
    Text,
    Voice,
    Sticker,
    System,
}

impl RemoteMessageRecord {
    /// Maps the record into the canonical shape. Missing fields fall back to
    /// defaults instead of failing, so an otherwise-deliverable message is
    /// never dropped for a malformed payload.
    pub fn into_message(self, room_id: &RoomId, current_user: &UserId) -> Message {
        let sender_id = UserId::new(self.sender_id.unwrap_or_default());
        let from_me = sender_id == *current_user;
        let kind = match (self.kind, self.sticker_id) {
            (Some(RemoteKindTag::Sticker), Some(sticker_id)) | (None, Some(sticker_id)) => {
                MessageKind::Sticker {
                    sticker_id,
                    pack_id: None,
                }
            }
            (Some(RemoteKindTag::System), _) => MessageKind::System {
                body: self.text.unwrap_or_default(),
            },
            (Some(RemoteKindTag::Voice), _) => MessageKind::Voice {
                url: self.text.unwrap_or_default(),
                duration_ms: 0,
            },
            _ => MessageKind::Text {
                body: self.text.unwrap_or_default(),
            },
        };

        Message {
            id: self
                .id
                .map(MessageId::new)
                .unwrap_or_else(MessageId::local),
            client_id: ClientId::new(self.client_id.unwrap_or_default()),
            room_id: room_id.clone(),
            conversation_id: self.conversation_id.map(ConversationId::new),
            sender_id,
            from_me,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            updated_at: None,
            status: MessageStatus::Sent,
            kind,
            attachments: self.attachments,
            reply_to_id: self.reply_to_id.map(MessageId::new),
            is_edited: self.is_edited,
            is_deleted: self.is_deleted,
            is_pinned: false,
            is_starred: false,
            send_attempts: 0,
        }
    }
}

/// Frames pushed by the remote service over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerPush {
    MessageReceived { message: RemoteMessageRecord },
    RoomJoined { room_id: String },
    RoomLeft { room_id: String },
}

/// Frames the client writes to the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationCreateRequest {
    pub title: String,
    pub participant_identifiers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationCreateResponse {
    pub conversation_id: String,
}
