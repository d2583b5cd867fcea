use super::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{routing::post, Json, Router};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

/// Replays scripted outcomes newest-call-first; once the script is empty it
/// keeps answering `conv-created`.
struct StubDirectory {
    calls: AtomicUsize,
    outcomes: AsyncMutex<Vec<Result<ConversationId, DirectoryError>>>,
}

impl StubDirectory {
    fn creating() -> Arc<Self> {
        Self::scripted(vec![])
    }

    fn scripted(outcomes: Vec<Result<ConversationId, DirectoryError>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcomes: AsyncMutex::new(outcomes),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationDirectory for StubDirectory {
    async fn create_conversation(
        &self,
        _request: ConversationCreateRequest,
    ) -> Result<ConversationId, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent resolvers actually overlap here.
        tokio::task::yield_now().await;
        match self.outcomes.lock().await.pop() {
            Some(outcome) => outcome,
            None => Ok(ConversationId::new("conv-created")),
        }
    }
}

#[tokio::test]
async fn known_identity_is_returned_without_a_directory_call() {
    let directory = StubDirectory::creating();
    let resolver = ConversationResolver::new(directory.clone());

    let mut handle = ChatHandle::direct(RoomId::new("r1"), "Alice", vec!["alice@x".into()]);
    handle.conversation_id = Some(ConversationId::new("conv-known"));

    let resolved = resolver.resolve(&handle).await.expect("resolve");
    assert_eq!(resolved, Some(ConversationId::new("conv-known")));
    assert_eq!(directory.calls(), 0);
}

#[tokio::test]
async fn group_chats_use_the_local_handle() {
    let directory = StubDirectory::creating();
    let resolver = ConversationResolver::new(directory.clone());

    let handle = ChatHandle::group(RoomId::new("team-chat"), "Team");
    let resolved = resolver.resolve(&handle).await.expect("resolve");

    assert_eq!(resolved, Some(ConversationId::new("team-chat")));
    assert_eq!(directory.calls(), 0);
}

#[tokio::test]
async fn direct_chat_without_participants_is_rejected() {
    let resolver = ConversationResolver::new(StubDirectory::creating());
    let handle = ChatHandle::direct(RoomId::new("r1"), "Alice", vec![]);

    let err = resolver.resolve(&handle).await.expect_err("no participants");
    assert!(matches!(err, SyncError::IdentityResolution { .. }));
}

#[tokio::test]
async fn first_use_creates_remotely_then_memoizes() {
    let directory = StubDirectory::creating();
    let resolver = ConversationResolver::new(directory.clone());
    let handle = ChatHandle::direct(RoomId::new("r1"), "Alice", vec!["alice@x".into()]);

    let first = resolver.resolve(&handle).await.expect("resolve");
    let second = resolver.resolve(&handle).await.expect("resolve");

    assert_eq!(first, Some(ConversationId::new("conv-created")));
    assert_eq!(second, first);
    assert_eq!(directory.calls(), 1);
}

#[tokio::test]
async fn concurrent_resolution_creates_exactly_once() {
    let directory = StubDirectory::creating();
    let resolver = ConversationResolver::new(directory.clone());
    let handle = ChatHandle::direct(RoomId::new("r1"), "Alice", vec!["alice@x".into()]);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let resolver = resolver.clone();
            let handle = handle.clone();
            tokio::spawn(async move { resolver.resolve(&handle).await })
        })
        .collect();

    for task in tasks {
        let resolved = task.await.expect("join").expect("resolve");
        assert_eq!(resolved, Some(ConversationId::new("conv-created")));
    }
    assert_eq!(directory.calls(), 1);
}

/// Parks every create call on a semaphore so the test controls exactly when
/// each attempt resolves.
struct GatedDirectory {
    calls: AtomicUsize,
    gate: Semaphore,
    outcomes: AsyncMutex<Vec<Result<ConversationId, DirectoryError>>>,
}

#[async_trait]
impl ConversationDirectory for GatedDirectory {
    async fn create_conversation(
        &self,
        _request: ConversationCreateRequest,
    ) -> Result<ConversationId, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.expect("gate open").forget();
        match self.outcomes.lock().await.pop() {
            Some(outcome) => outcome,
            None => Ok(ConversationId::new("conv-created")),
        }
    }
}

#[tokio::test]
async fn late_success_on_an_abandoned_attempt_is_still_shared() {
    let directory = Arc::new(GatedDirectory {
        calls: AtomicUsize::new(0),
        gate: Semaphore::new(0),
        outcomes: AsyncMutex::new(vec![
            Ok(ConversationId::new("conv-late")),
            Err(DirectoryError::Transient("timeout".into())),
        ]),
    });
    let resolver = ConversationResolver::new(directory.clone());
    let handle = ChatHandle::direct(RoomId::new("r1"), "Alice", vec!["alice@x".into()]);

    let spawn_resolve = |resolver: Arc<ConversationResolver>, handle: ChatHandle| {
        tokio::spawn(async move { resolver.resolve(&handle).await })
    };
    let first = spawn_resolve(resolver.clone(), handle.clone());
    let second = spawn_resolve(resolver.clone(), handle.clone());

    // Let one attempt start and the other caller queue up behind it.
    while directory.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The first attempt fails; the queued caller takes over the same slot.
    directory.gate.add_permits(1);
    while directory.calls.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }
    directory.gate.add_permits(1);

    let outcomes = [
        first.await.expect("join").expect("resolve"),
        second.await.expect("join").expect("resolve"),
    ];
    assert!(outcomes.contains(&Some(ConversationId::new("conv-late"))));

    // The shared result is visible to later resolves: no second conversation
    // is ever created for this handle.
    let third = resolver.resolve(&handle).await.expect("resolve");
    assert_eq!(third, Some(ConversationId::new("conv-late")));
    assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transient_failure_resolves_to_none_and_retries_later() {
    let directory = StubDirectory::scripted(vec![
        Ok(ConversationId::new("conv-second-try")),
        Err(DirectoryError::Transient("timeout".into())),
    ]);
    let resolver = ConversationResolver::new(directory.clone());
    let handle = ChatHandle::direct(RoomId::new("r1"), "Alice", vec!["alice@x".into()]);

    // First attempt degrades to local-only, second succeeds.
    assert_eq!(resolver.resolve(&handle).await.expect("resolve"), None);
    assert_eq!(
        resolver.resolve(&handle).await.expect("resolve"),
        Some(ConversationId::new("conv-second-try"))
    );
    assert_eq!(directory.calls(), 2);
}

#[tokio::test]
async fn unauthorized_creation_aborts_the_send() {
    let resolver = ConversationResolver::new(StubDirectory::scripted(vec![Err(
        DirectoryError::Unauthorized,
    )]));
    let handle = ChatHandle::direct(RoomId::new("r1"), "Alice", vec!["alice@x".into()]);

    let err = resolver.resolve(&handle).await.expect_err("unauthorized");
    assert!(matches!(err, SyncError::IdentityResolution { .. }));
}

async fn spawn_directory_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn http_directory_posts_the_create_request() {
    let app = Router::new().route(
        "/conversations",
        post(|Json(request): Json<ConversationCreateRequest>| async move {
            assert_eq!(request.participant_identifiers, vec!["alice@x".to_string()]);
            Json(ConversationCreateResponse {
                conversation_id: "conv-http".into(),
            })
        }),
    );
    let base = spawn_directory_server(app).await;

    let directory =
        HttpConversationDirectory::new(base, Some("token-1".into()), Duration::from_secs(5));
    let created = directory
        .create_conversation(ConversationCreateRequest {
            title: "Alice".into(),
            participant_identifiers: vec!["alice@x".into()],
        })
        .await
        .expect("create");

    assert_eq!(created, ConversationId::new("conv-http"));
}

#[tokio::test]
async fn http_directory_gives_up_on_a_stalled_server() {
    let app = Router::new().route(
        "/conversations",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Json(ConversationCreateResponse {
                conversation_id: "too-late".into(),
            })
        }),
    );
    let base = spawn_directory_server(app).await;

    let directory =
        HttpConversationDirectory::new(base, Some("tok".into()), Duration::from_millis(200));
    let started = Instant::now();
    let err = directory
        .create_conversation(ConversationCreateRequest {
            title: "Alice".into(),
            participant_identifiers: vec!["alice@x".into()],
        })
        .await
        .expect_err("must time out");

    assert!(matches!(err, DirectoryError::Transient(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn http_directory_without_a_token_is_unauthorized() {
    let directory =
        HttpConversationDirectory::new("http://127.0.0.1:9", None, Duration::from_secs(5));
    let err = directory
        .create_conversation(ConversationCreateRequest {
            title: "Alice".into(),
            participant_identifiers: vec!["alice@x".into()],
        })
        .await
        .expect_err("no token");
    assert!(matches!(err, DirectoryError::Unauthorized));
}
