pub mod assets;
pub mod controller;
pub mod facade;
pub mod resolver;
pub mod settings;
pub mod transport;

pub use assets::{AssetCache, AssetFetcher, HttpAssetFetcher};
pub use controller::{FlushPolicy, MessagePatch, MessageSender, SyncController};
pub use facade::Messaging;
pub use resolver::{
    ChatHandle, ConversationDirectory, ConversationResolver, DirectoryError,
    HttpConversationDirectory,
};
pub use settings::{load_settings, prepare_database_url, Settings};
pub use transport::{
    SessionEvent, Transport, TransportEvent, TransportSender, TransportSession, WsTransport,
};
