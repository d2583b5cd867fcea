use super::*;
use chrono::{Duration, Utc};
use shared::domain::{Attachment, ConversationId, MessageKind, UserId};

fn room(name: &str) -> RoomId {
    RoomId::new(name)
}

fn text_message(room_id: &RoomId, body: &str) -> Message {
    Message::draft(
        room_id.clone(),
        UserId::new("alice"),
        MessageKind::Text {
            body: body.to_string(),
        },
    )
}

#[tokio::test]
async fn round_trips_messages_field_for_field() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");

    let mut sticker = Message::draft(
        r1.clone(),
        UserId::new("alice"),
        MessageKind::Sticker {
            sticker_id: "stk-7".into(),
            pack_id: Some("pack-1".into()),
        },
    );
    sticker.attachments.push(Attachment {
        id: "att-1".into(),
        url: "https://cdn.example/att-1".into(),
        filename: Some("photo.png".into()),
        mime_type: Some("image/png".into()),
        size_bytes: Some(2048),
    });
    sticker.is_starred = true;
    let plain = text_message(&r1, "hello");

    let saved = vec![plain, sticker];
    store.save(&r1, &saved).await;

    let loaded = store.load(&r1).await;
    assert_eq!(loaded, saved);
}

#[tokio::test]
async fn load_returns_empty_for_unknown_room() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    assert!(store.load(&room("nowhere")).await.is_empty());
}

#[tokio::test]
async fn rooms_are_isolated() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let a = room("room-a");
    let b = room("room-b");

    store.save(&a, &[text_message(&a, "only in a")]).await;

    assert_eq!(store.load(&a).await.len(), 1);
    assert!(store.load(&b).await.is_empty());
}

#[tokio::test]
async fn orders_by_created_at_with_insertion_tiebreak() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");
    let base = Utc::now();

    let mut newest = text_message(&r1, "newest");
    newest.created_at = base + Duration::seconds(10);
    let mut oldest = text_message(&r1, "oldest");
    oldest.created_at = base - Duration::seconds(10);
    let mut tied_first = text_message(&r1, "tied first");
    tied_first.created_at = base;
    let mut tied_second = text_message(&r1, "tied second");
    tied_second.created_at = base;

    // Insert out of order; ties keep insertion order.
    store.upsert(&r1, &newest).await;
    store.upsert(&r1, &tied_first).await;
    store.upsert(&r1, &tied_second).await;
    store.upsert(&r1, &oldest).await;

    let ids: Vec<_> = store.load(&r1).await.into_iter().map(|m| m.id).collect();
    assert_eq!(
        ids,
        vec![oldest.id, tied_first.id, tied_second.id, newest.id]
    );
}

#[tokio::test]
async fn upsert_merges_into_existing_record() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");

    let mut original = text_message(&r1, "draft");
    original.conversation_id = Some(ConversationId::new("conv-9"));
    store.upsert(&r1, &original).await;

    let mut updated = original.clone();
    updated.conversation_id = None; // omitted fields survive the merge
    updated.kind = MessageKind::Text {
        body: "edited".into(),
    };
    updated.is_edited = true;
    store.upsert(&r1, &updated).await;

    let loaded = store.load(&r1).await;
    assert_eq!(loaded.len(), 1);
    assert!(loaded[0].is_edited);
    assert_eq!(
        loaded[0].kind,
        MessageKind::Text {
            body: "edited".into()
        }
    );
    assert_eq!(
        loaded[0].conversation_id,
        Some(ConversationId::new("conv-9"))
    );
}

#[tokio::test]
async fn removes_single_message() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");

    let keep = text_message(&r1, "keep");
    let gone = text_message(&r1, "drop");
    store.save(&r1, &[keep.clone(), gone.clone()]).await;

    store.remove(&r1, &gone.id).await;

    let loaded = store.load(&r1).await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, keep.id);
}

#[tokio::test]
async fn update_status_rewrites_stored_body() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");

    let message = text_message(&r1, "hi");
    store.save(&r1, &[message.clone()]).await;

    store
        .update_status(&r1, &message.id, MessageStatus::Sent)
        .await;

    let loaded = store.load(&r1).await;
    assert_eq!(loaded[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn update_status_for_missing_message_is_a_noop() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");
    store
        .update_status(&r1, &MessageId::new("ghost"), MessageStatus::Sent)
        .await;
    assert!(store.load(&r1).await.is_empty());
}

#[tokio::test]
async fn bulk_update_transforms_every_message() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");

    store
        .save(&r1, &[text_message(&r1, "a"), text_message(&r1, "b")])
        .await;

    store
        .bulk_update(&r1, |message| {
            message.is_starred = true;
        })
        .await;

    let loaded = store.load(&r1).await;
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().all(|m| m.is_starred));
}

#[tokio::test]
async fn skips_corrupt_rows_on_load() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let r1 = room("r1");

    let good = text_message(&r1, "good");
    store.save(&r1, &[good.clone()]).await;

    sqlx::query(
        "INSERT INTO room_messages (room_id, message_id, client_id, created_at, status, body)
         VALUES (?, 'broken', '', '2024-01-01T00:00:00Z', 'pending', 'not json')",
    )
    .bind(r1.as_str())
    .execute(store.pool())
    .await
    .expect("inject corrupt row");

    let loaded = store.load(&r1).await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, good.id);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("messages.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = MessageStore::new(&database_url).await.expect("db");
    store.health_check().await.expect("health check");
    drop(store);

    assert!(db_path.exists());
}
