use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

use shared::domain::{MessageId, MessageKind, RoomId, UserId};
use storage::MessageStore;
use sync_core::{
    load_settings, prepare_database_url, AssetCache, ChatHandle, FlushPolicy,
    HttpAssetFetcher, HttpConversationDirectory, ConversationResolver, MessagePatch, Messaging,
    SyncController, WsTransport,
};

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the configured database url.
    #[arg(long)]
    database_url: Option<String>,
    /// Overrides the configured server url.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = "cli-user")]
    user: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sends a text message into a room, queueing it if the server is
    /// unreachable.
    Send { room: String, body: String },
    /// Prints the room's stored messages in display order.
    List { room: String },
    /// Re-attempts delivery of everything the room still owes the server.
    Flush { room: String },
    /// Replaces a message's text and queues the edit for delivery.
    Edit {
        room: String,
        message_id: String,
        body: String,
    },
    /// Soft-deletes a message; the tombstone keeps its place in the room.
    Delete { room: String, message_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }

    let database_url = prepare_database_url(&settings.database_url)?;
    let store = MessageStore::new(&database_url).await?;

    match cli.command {
        Command::List { room } => {
            let messages = store.load(&RoomId::new(room)).await;
            if messages.is_empty() {
                println!("(no messages)");
                return Ok(());
            }
            for message in messages {
                let body = match &message.kind {
                    MessageKind::Text { body } | MessageKind::System { body } => body.clone(),
                    other => format!("{other:?}"),
                };
                let marker = if message.is_deleted { " [deleted]" } else { "" };
                println!(
                    "{} {:>9} {} {}{}",
                    message.created_at.format("%Y-%m-%d %H:%M:%S"),
                    format!("[{:?}]", message.status).to_lowercase(),
                    message.sender_id,
                    body,
                    marker,
                );
            }
        }
        Command::Send { room, body } => {
            let messaging = build_messaging(store, &settings, &cli.user, &room).await?;
            let message = messaging.send_text(body).await?;
            println!(
                "queued message {} (status: {:?})",
                message.id, message.status
            );
        }
        Command::Flush { room } => {
            let messaging = build_messaging(store, &settings, &cli.user, &room).await?;
            messaging.flush_queue().await;
            let pending = messaging
                .messages()
                .await
                .iter()
                .filter(|m| m.status.needs_send())
                .count();
            println!("flush complete, {pending} message(s) still pending");
        }
        Command::Edit {
            room,
            message_id,
            body,
        } => {
            let messaging = build_messaging(store, &settings, &cli.user, &room).await?;
            let edited = messaging
                .edit(&MessageId::new(message_id), MessagePatch::text(body))
                .await?;
            println!("edited message {} (status: {:?})", edited.id, edited.status);
        }
        Command::Delete { room, message_id } => {
            let messaging = build_messaging(store, &settings, &cli.user, &room).await?;
            let deleted = messaging.soft_delete(&MessageId::new(message_id)).await?;
            println!("deleted message {}", deleted.id);
        }
    }

    Ok(())
}

/// Wires the full messaging stack for one room. Connection failures are
/// tolerated: the command still runs against the local store and the send
/// queue picks the work up next time the transport comes back.
async fn build_messaging(
    store: MessageStore,
    settings: &sync_core::Settings,
    user: &str,
    room: &str,
) -> Result<Arc<Messaging>> {
    let current_user = UserId::new(user);
    let controller = SyncController::with_policy(
        store,
        current_user.clone(),
        FlushPolicy {
            max_send_attempts: settings.max_send_attempts,
        },
    );
    let transport = WsTransport::new(
        settings.server_url.clone(),
        current_user,
        settings.request_timeout(),
    );
    let resolver = ConversationResolver::new(Arc::new(HttpConversationDirectory::new(
        settings.server_url.clone(),
        settings.auth_token.clone(),
        settings.request_timeout(),
    )));
    let assets = AssetCache::new(Arc::new(HttpAssetFetcher::new(
        settings.server_url.clone(),
        settings.request_timeout(),
    )));

    let messaging = Messaging::new(
        controller,
        transport,
        resolver,
        assets,
        settings.history_limit,
    )
    .await;

    if let Err(err) = messaging
        .connect(settings.auth_token.as_deref().unwrap_or_default())
        .await
    {
        warn!("server unreachable, working offline: {err:#}");
    }

    messaging
        .open_chat(ChatHandle::group(RoomId::new(room), room))
        .await;
    Ok(messaging)
}
