//! Engine facade wiring the API client, the push channel and the domain
//! collections together for one user session.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{
    ApiClient, AuthSession, FileMarker, HttpTransport, MemoryMarker, ReqwestTransport,
    SessionMarkerStore, SessionState,
};
use crate::chat::{ChatSync, LiveChatFeed};
use crate::config::ClientConfig;
use crate::items::ItemFeed;
use crate::model::{CurrentUser, ItemId, LoanRequest};
use crate::push::{PushChannel, PushConnector, PushKind, PushMessage, Subscription, WebSocketConnector};
use crate::sync::SyncResult;

/// Push subscriptions held while the engine is live
struct LiveHandles {
    _chats: LiveChatFeed,
    _validation: Subscription,
}

pub struct SyncEngine {
    config: ClientConfig,
    session: Arc<AuthSession>,
    client: Arc<ApiClient>,
    push: PushChannel,
    chats: Arc<ChatSync>,
    items: ItemFeed,
    live: Arc<Mutex<Option<LiveHandles>>>,
    session_watch: JoinHandle<()>,
}

impl SyncEngine {
    /// Build an engine talking to the configured API over HTTP and WebSocket
    pub fn connect(config: ClientConfig) -> SyncResult<Self> {
        config.validate()?;

        let api_base = config.api_base()?;
        let transport = ReqwestTransport::new(api_base.clone(), config.timeout)?;
        let connector = WebSocketConnector::new(config.websocket_url()?.to_string())
            .with_cookies(transport.cookie_jar(), api_base);

        let marker: Arc<dyn SessionMarkerStore> = match &config.session_file {
            Some(path) => Arc::new(FileMarker::new(path)),
            None => Arc::new(MemoryMarker::default()),
        };

        info!("Sync engine targeting {}", config.api_url);
        Ok(Self::with_parts(
            config,
            Arc::new(transport),
            Arc::new(connector),
            marker,
        ))
    }

    /// Build an engine from explicit transports.
    ///
    /// Must be called within a Tokio runtime: the engine follows the
    /// session state on a background task.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn PushConnector>,
        marker: Arc<dyn SessionMarkerStore>,
    ) -> Self {
        let session = Arc::new(AuthSession::new(marker));
        let client = Arc::new(ApiClient::new(transport, session.clone()));
        let chats = Arc::new(ChatSync::new(client.clone(), config.page_size));
        let items = ItemFeed::new(client.clone(), config.page_size);
        let live = Arc::new(Mutex::new(None));
        let session_watch = tokio::spawn(follow_session(
            session.subscribe(),
            live.clone(),
            chats.clone(),
        ));

        Self {
            config,
            session,
            client,
            push: PushChannel::new(connector),
            chats,
            items,
            live,
            session_watch,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    pub fn push(&self) -> &PushChannel {
        &self.push
    }

    pub fn chats(&self) -> &Arc<ChatSync> {
        &self.chats
    }

    pub fn items(&self) -> &ItemFeed {
        &self.items
    }

    /// Log in; per-user collections loaded while anonymous start over
    pub async fn login(&self, username: &str, password: &str) -> SyncResult<Option<CurrentUser>> {
        let user = self.client.login(username, password).await?;
        self.chats.reset_all();
        Ok(user)
    }

    pub async fn current_user(&self) -> SyncResult<Option<CurrentUser>> {
        self.client.current_user().await
    }

    /// Subscribe to chat and account pushes. No-op if already live or
    /// without an active session.
    pub fn start_live(&self) -> SyncResult<()> {
        if !self.session.is_active() {
            debug!("No active session, not starting live updates");
            return Ok(());
        }

        let mut live = self.live.lock();
        if live.is_some() {
            return Ok(());
        }

        let chats = self.chats.attach(&self.push)?;

        let session = self.session.clone();
        let validation =
            self.push
                .subscribe_message(PushKind::UpdatedAccountValidation, move |message| {
                    if let PushMessage::UpdatedAccountValidation { validated } = message {
                        session.set_validated(validated);
                    }
                })?;

        *live = Some(LiveHandles {
            _chats: chats,
            _validation: validation,
        });
        info!("Live updates started");
        Ok(())
    }

    /// Drop every push subscription; the socket closes with the last one
    pub fn stop_live(&self) {
        if self.live.lock().take().is_some() {
            info!("Live updates stopped");
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.lock().is_some()
    }

    /// Ask to borrow an item, then reload the chat the request landed in
    pub async fn request_item(&self, item_id: ItemId) -> SyncResult<LoanRequest> {
        let request = self.items.request_item(item_id).await?;
        self.chats.invalidate_chat(&request.chat_id);
        Ok(request)
    }

    /// Withdraw a loan request, reloading its chat when the server names it
    pub async fn unrequest_item(&self, item_id: ItemId) -> SyncResult<Option<LoanRequest>> {
        let request = self.items.unrequest_item(item_id).await?;
        if let Some(request) = &request {
            self.chats.invalidate_chat(&request.chat_id);
        }
        Ok(request)
    }

    /// End the session and forget all per-user data
    pub async fn logout(&self) -> SyncResult<()> {
        self.stop_live();
        let result = self.client.logout().await;
        if let Err(e) = &result {
            warn!("Logout request failed: {}", e);
        }
        self.chats.reset_all();
        result
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.session_watch.abort();
    }
}

/// Stop live updates and drop per-user data once the session expires
async fn follow_session(
    mut state: tokio::sync::watch::Receiver<SessionState>,
    live: Arc<Mutex<Option<LiveHandles>>>,
    chats: Arc<ChatSync>,
) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        if current != SessionState::Expired {
            continue;
        }

        let stopped = live.lock().take();
        drop(stopped);
        chats.reset_all();
        info!("Session expired, live updates stopped and chat data cleared");
    }
    debug!("Session watcher ended");
}
