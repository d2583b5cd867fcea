use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(RoomId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ClientId);
id_newtype!(UserId);

const LOCAL_ID_PREFIX: &str = "local-";

impl MessageId {
    /// Temporary id for a draft that has not been acknowledged by the server.
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    LocalOnly,
    Pending,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the delivery ladder. `Failed` sits beside `Sending`: it is
    /// a terminal outcome of an attempt, not a later delivery stage.
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::LocalOnly => 0,
            MessageStatus::Pending => 1,
            MessageStatus::Sending | MessageStatus::Failed => 2,
            MessageStatus::Sent => 3,
            MessageStatus::Delivered => 4,
            MessageStatus::Read => 5,
        }
    }

    /// Whether moving to `next` is a legal transition. Forward movement is
    /// always allowed; the only regressions are `failed -> pending` (retry)
    /// and `pending/failed -> sent` (late success). A `sent` or higher
    /// message never drops back below `sent`.
    pub fn accepts(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Failed, Pending) | (Failed, Sending) | (Failed, Sent) => true,
            (Sent | Delivered | Read, Pending | Sending | Failed | LocalOnly) => false,
            _ => next.rank() >= self.rank(),
        }
    }

    pub fn needs_send(self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleSpan {
    pub start: u32,
    pub end: u32,
    pub style: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactCard {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Exactly one semantic payload per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum MessageKind {
    Text {
        body: String,
    },
    Voice {
        url: String,
        duration_ms: u32,
    },
    StyledText {
        body: String,
        spans: Vec<StyleSpan>,
    },
    Sticker {
        sticker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pack_id: Option<String>,
    },
    ContactCards {
        cards: Vec<ContactCard>,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
    Event {
        title: String,
        starts_at: DateTime<Utc>,
    },
    System {
        body: String,
    },
}

impl MessageKind {
    /// True when the payload carries nothing worth sending.
    pub fn is_blank(&self) -> bool {
        match self {
            MessageKind::Text { body } | MessageKind::System { body } => body.trim().is_empty(),
            MessageKind::StyledText { body, .. } => body.trim().is_empty(),
            MessageKind::Voice { url, .. } => url.is_empty(),
            MessageKind::Sticker { sticker_id, .. } => sticker_id.is_empty(),
            MessageKind::ContactCards { cards } => cards.is_empty(),
            MessageKind::Poll { question, options } => {
                question.trim().is_empty() || options.is_empty()
            }
            MessageKind::Event { title, .. } => title.trim().is_empty(),
        }
    }

    pub fn sticker_reference(&self) -> Option<&str> {
        match self {
            MessageKind::Sticker { sticker_id, .. } => Some(sticker_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub client_id: ClientId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub from_me: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_starred: bool,
    /// Delivery attempts consumed by the flush queue. Reset when the user
    /// edits or deletes the message, which re-arms retries.
    #[serde(default)]
    pub send_attempts: u32,
}

impl Message {
    /// Builds a locally-originated draft: temporary id, fresh client id,
    /// `pending` status. Durable before any network attempt.
    pub fn draft(room_id: RoomId, sender_id: UserId, kind: MessageKind) -> Self {
        Self {
            id: MessageId::local(),
            client_id: ClientId::generate(),
            room_id,
            conversation_id: None,
            sender_id,
            from_me: true,
            created_at: Utc::now(),
            updated_at: None,
            status: MessageStatus::Pending,
            kind,
            attachments: Vec::new(),
            reply_to_id: None,
            is_edited: false,
            is_deleted: false,
            is_pinned: false,
            is_starred: false,
            send_attempts: 0,
        }
    }

    /// Soft delete: content is cleared but id, timestamp and sender survive
    /// so ordering and reply references stay intact.
    pub fn redact(&mut self) {
        self.kind = MessageKind::Text { body: String::new() };
        self.attachments.clear();
        self.is_deleted = true;
        self.updated_at = Some(Utc::now());
    }

    /// Applies a status change, ignoring transitions the state machine
    /// forbids. Returns whether the status actually moved.
    pub fn apply_status(&mut self, next: MessageStatus) -> bool {
        if self.status == next || !self.status.accepts(next) {
            return false;
        }
        self.status = next;
        true
    }
}

/// Caller-supplied fields merged into a draft by the send path.
#[derive(Debug, Clone, Default)]
pub struct OutgoingDraft {
    pub kind: Option<MessageKind>,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<MessageId>,
    pub conversation_id: Option<ConversationId>,
}

impl OutgoingDraft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: Some(MessageKind::Text { body: body.into() }),
            ..Self::default()
        }
    }

    /// A draft with neither a payload nor attachments has nothing to send.
    pub fn is_blank(&self) -> bool {
        self.kind.as_ref().map_or(true, MessageKind::is_blank) && self.attachments.is_empty()
    }
}
