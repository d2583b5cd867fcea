use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::transport::http_client;

use shared::{
    domain::{ConversationId, RoomId},
    error::SyncError,
    protocol::{ConversationCreateRequest, ConversationCreateResponse},
};

/// A local chat handle awaiting (or carrying) its remote conversation
/// identity.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    pub room_id: RoomId,
    pub is_direct: bool,
    pub conversation_id: Option<ConversationId>,
    pub title: String,
    pub participant_identifiers: Vec<String>,
}

impl ChatHandle {
    pub fn direct(room_id: RoomId, title: impl Into<String>, participants: Vec<String>) -> Self {
        Self {
            room_id,
            is_direct: true,
            conversation_id: None,
            title: title.into(),
            participant_identifiers: participants,
        }
    }

    pub fn group(room_id: RoomId, title: impl Into<String>) -> Self {
        Self {
            room_id,
            is_direct: false,
            conversation_id: None,
            title: title.into(),
            participant_identifiers: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("not authenticated")]
    Unauthorized,
    #[error("invalid conversation request: {0}")]
    Invalid(String),
    #[error("transient directory failure: {0}")]
    Transient(String),
}

/// Remote conversation-creation capability.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn create_conversation(
        &self,
        request: ConversationCreateRequest,
    ) -> Result<ConversationId, DirectoryError>;
}

/// Maps a chat handle to its stable remote conversation id, creating one
/// remotely on first use for direct chats. Creation is memoized per room
/// handle, in-flight included, so concurrent sends cannot double-create.
pub struct ConversationResolver {
    directory: Arc<dyn ConversationDirectory>,
    cells: Mutex<HashMap<RoomId, Arc<OnceCell<ConversationId>>>>,
}

impl ConversationResolver {
    pub fn new(directory: Arc<dyn ConversationDirectory>) -> Arc<Self> {
        Arc::new(Self {
            directory,
            cells: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves the conversation id for a handle.
    ///
    /// `Ok(Some(..))`: resolved, possibly just created. `Ok(None)`:
    /// transient failure, the caller proceeds local-only and retries on the
    /// next send. `Err(..)`: precondition failure (no auth, no
    /// participants), the operation aborts with an actionable message and
    /// nothing is cached.
    pub async fn resolve(&self, handle: &ChatHandle) -> Result<Option<ConversationId>, SyncError> {
        if let Some(id) = &handle.conversation_id {
            return Ok(Some(id.clone()));
        }
        if !handle.is_direct {
            // Non-direct chats use the local handle as-is.
            return Ok(Some(ConversationId::new(handle.room_id.as_str())));
        }
        if handle.participant_identifiers.is_empty() {
            return Err(SyncError::identity(
                "direct chat has no participant identifiers",
            ));
        }

        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry(handle.room_id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let created = cell
            .get_or_try_init(|| async {
                info!(room_id = %handle.room_id, "creating remote conversation");
                self.directory
                    .create_conversation(ConversationCreateRequest {
                        title: handle.title.clone(),
                        participant_identifiers: handle.participant_identifiers.clone(),
                    })
                    .await
            })
            .await;

        match created {
            Ok(id) => {
                let id = id.clone();
                // A failed sibling attempt may have dropped this cell from
                // the map while we were still initializing it; put it back
                // so every later resolve shares this result instead of
                // creating a second remote conversation.
                let mut cells = self.cells.lock().await;
                cells
                    .entry(handle.room_id.clone())
                    .or_insert_with(|| Arc::clone(&cell));
                Ok(Some(id))
            }
            Err(err) => {
                // Drop the cell so the next send can retry, unless a retry
                // already installed a fresh one or a concurrent caller
                // managed to initialize this one after our attempt failed.
                let mut cells = self.cells.lock().await;
                if let Some(current) = cells.get(&handle.room_id) {
                    if Arc::ptr_eq(current, &cell) && current.get().is_none() {
                        cells.remove(&handle.room_id);
                    }
                }
                match err {
                    DirectoryError::Unauthorized => {
                        Err(SyncError::identity("not signed in to the message service"))
                    }
                    DirectoryError::Invalid(reason) => Err(SyncError::identity(reason)),
                    DirectoryError::Transient(reason) => {
                        warn!(room_id = %handle.room_id, "conversation creation failed: {reason}");
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Directory backed by the service's HTTP API.
pub struct HttpConversationDirectory {
    http: Client,
    server_url: String,
    auth_token: Option<String>,
}

impl HttpConversationDirectory {
    pub fn new(
        server_url: impl Into<String>,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http: http_client(request_timeout),
            server_url: server_url.into(),
            auth_token,
        }
    }
}

#[async_trait]
impl ConversationDirectory for HttpConversationDirectory {
    async fn create_conversation(
        &self,
        request: ConversationCreateRequest,
    ) -> Result<ConversationId, DirectoryError> {
        let token = self
            .auth_token
            .as_deref()
            .ok_or(DirectoryError::Unauthorized)?;

        let response = self
            .http
            .post(format!("{}/conversations", self.server_url))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|err| DirectoryError::Transient(err.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DirectoryError::Unauthorized);
        }
        if response.status().is_client_error() {
            return Err(DirectoryError::Invalid(format!(
                "server rejected conversation: {}",
                response.status()
            )));
        }

        let body: ConversationCreateResponse = response
            .error_for_status()
            .map_err(|err| DirectoryError::Transient(err.to_string()))?
            .json()
            .await
            .map_err(|err| DirectoryError::Transient(err.to_string()))?;

        Ok(ConversationId::new(body.conversation_id))
    }
}

#[cfg(test)]
#[path = "tests/resolver_tests.rs"]
mod tests;
