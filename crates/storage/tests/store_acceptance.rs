use shared::domain::{Message, MessageKind, MessageStatus, RoomId, UserId};
use storage::MessageStore;

#[tokio::test]
async fn messages_survive_a_store_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("messages.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    let room = RoomId::new("r1");

    let mut sent = Message::draft(
        room.clone(),
        UserId::new("alice"),
        MessageKind::Text {
            body: "offline durability".into(),
        },
    );
    sent.status = MessageStatus::Sent;
    let pending = Message::draft(
        room.clone(),
        UserId::new("alice"),
        MessageKind::Text {
            body: "still queued".into(),
        },
    );

    {
        let store = MessageStore::new(&database_url).await.expect("db");
        store.save(&room, &[sent.clone(), pending.clone()]).await;
    }

    let reopened = MessageStore::new(&database_url).await.expect("reopen");
    let loaded = reopened.load(&room).await;

    assert_eq!(loaded, vec![sent, pending]);
}

#[tokio::test]
async fn soft_deleted_message_keeps_identity_for_replies() {
    let store = MessageStore::new("sqlite::memory:").await.expect("db");
    let room = RoomId::new("r1");

    let mut target = Message::draft(
        room.clone(),
        UserId::new("alice"),
        MessageKind::Text {
            body: "delete me".into(),
        },
    );
    let mut reply = Message::draft(
        room.clone(),
        UserId::new("bob"),
        MessageKind::Text {
            body: "replying".into(),
        },
    );
    reply.reply_to_id = Some(target.id.clone());

    target.redact();
    store.save(&room, &[target.clone(), reply.clone()]).await;

    let loaded = store.load(&room).await;
    let stored_target = loaded
        .iter()
        .find(|m| m.id == target.id)
        .expect("target still present");
    let stored_reply = loaded.iter().find(|m| m.id == reply.id).expect("reply");

    assert!(stored_target.is_deleted);
    assert_eq!(
        stored_target.kind,
        MessageKind::Text { body: String::new() }
    );
    assert_eq!(stored_target.created_at, target.created_at);
    assert_eq!(stored_reply.reply_to_id, Some(target.id.clone()));
}
