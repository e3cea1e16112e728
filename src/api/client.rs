//! API client with single-retry credential refresh.
//!
//! Every request goes through [`ApiClient::send`]:
//!
//! ```text
//! execute ──► 401? ──no──► done
//!               │
//!            marker set? ──no──► done (401)
//!               │
//!            refresh (shared by concurrent 401s)
//!               ├── failed ──► session expired, done (401)
//!               └── ok ──► replayable? ──no──► done (401)
//!                               │
//!                            execute once more ──► done (a 401 here is final)
//! ```

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::session::AuthSession;
use super::{ApiRequest, ApiResponse, HttpTransport};
use crate::model::CurrentUser;
use crate::sync::{PageSource, QueryParams, RawPage, SyncResult};

pub const LOGIN_PATH: &str = "/v1/auth/login";
pub const LOGOUT_PATH: &str = "/v1/auth/logout";
pub const REFRESH_PATH: &str = "/v1/auth/refresh";
pub const ME_PATH: &str = "/v1/me";

type RefreshFuture = Shared<BoxFuture<'static, bool>>;

struct PendingRefresh {
    id: u64,
    future: RefreshFuture,
}

pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    session: Arc<AuthSession>,
    refresh: Arc<Mutex<Option<PendingRefresh>>>,
    refresh_ids: AtomicU64,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn HttpTransport>, session: Arc<AuthSession>) -> Self {
        Self {
            transport,
            session,
            refresh: Arc::new(Mutex::new(None)),
            refresh_ids: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    /// Execute `request`, refreshing credentials at most once on 401.
    ///
    /// Non-success statuses are returned as responses; see
    /// [`fetch`](Self::fetch) for the erroring variant.
    pub async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        let response = self.transport.execute(&request).await?;

        if !response.is_unauthorized() || !self.session.has_marker() {
            return Ok(response);
        }

        debug!("{} answered 401, refreshing session", request.route());
        if !self.refresh_session().await {
            return Ok(response);
        }

        if !request.can_replay() {
            debug!("{} is not replay-safe, not resending", request.route());
            return Ok(response);
        }

        let replayed = self.transport.execute(&request).await?;
        if replayed.is_unauthorized() {
            warn!("{} still unauthorized after refresh", request.route());
            self.session.expire();
        }
        Ok(replayed)
    }

    /// [`send`](Self::send), then turn non-success statuses into errors
    pub async fn fetch(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        self.send(request).await?.error_for_status()
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, request: ApiRequest) -> SyncResult<T> {
        self.fetch(request).await?.json()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: QueryParams,
    ) -> SyncResult<T> {
        self.fetch_json(ApiRequest::get(path).with_query(query))
            .await
    }

    /// Refresh the session cookie; concurrent callers share one attempt.
    ///
    /// The attempt runs on its own task and clears the shared slot when it
    /// settles, so a caller that gives up waiting leaves nothing stale behind.
    async fn refresh_session(&self) -> bool {
        let refresh = {
            let mut slot = self.refresh.lock();
            match slot.as_ref() {
                Some(pending) => pending.future.clone(),
                None => {
                    let id = self.refresh_ids.fetch_add(1, Ordering::Relaxed);
                    let transport = self.transport.clone();
                    let session = self.session.clone();
                    let shared_slot = self.refresh.clone();

                    let task = tokio::spawn(async move {
                        let refreshed = refresh_once(transport, session).await;
                        let mut slot = shared_slot.lock();
                        if slot.as_ref().map(|p| p.id == id).unwrap_or(false) {
                            *slot = None;
                        }
                        refreshed
                    });

                    let future = async move {
                        task.await.unwrap_or_else(|e| {
                            warn!("Session refresh task failed: {}", e);
                            false
                        })
                    }
                    .boxed()
                    .shared();

                    *slot = Some(PendingRefresh {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        refresh.await
    }

    /// Whether a refresh attempt is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.refresh.lock().is_some()
    }

    /// Log in with a password grant and load the current user
    pub async fn login(&self, username: &str, password: &str) -> SyncResult<Option<CurrentUser>> {
        let request = ApiRequest::post(LOGIN_PATH).with_form([
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ]);

        self.transport
            .execute(&request)
            .await?
            .error_for_status()?;
        self.session.establish();
        info!("Logged in as {}", username);

        self.current_user().await
    }

    pub async fn logout(&self) -> SyncResult<()> {
        self.transport
            .execute(&ApiRequest::post(LOGOUT_PATH))
            .await?
            .error_for_status()?;
        self.session.clear();
        Ok(())
    }

    /// Current user, or `None` when not logged in
    pub async fn current_user(&self) -> SyncResult<Option<CurrentUser>> {
        let response = self.send(ApiRequest::get(ME_PATH)).await?;

        if response.is_unauthorized() {
            self.session.set_user(None);
            return Ok(None);
        }

        let user: CurrentUser = response.error_for_status()?.json()?;
        self.session.set_user(Some(user.clone()));
        Ok(Some(user))
    }
}

async fn refresh_once(transport: Arc<dyn HttpTransport>, session: Arc<AuthSession>) -> bool {
    match transport.execute(&ApiRequest::post(REFRESH_PATH)).await {
        Ok(response) if response.is_success() => {
            info!("Session refreshed");
            true
        }
        Ok(response) => {
            warn!("Session refresh rejected with status {}", response.status);
            session.expire();
            false
        }
        Err(e) => {
            warn!("Session refresh failed: {}", e);
            false
        }
    }
}

/// A paginated list endpoint as a [`PageSource`]
pub struct ListEndpoint<T> {
    client: Arc<ApiClient>,
    path: String,
    requires_session: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ListEndpoint<T> {
    pub fn new(client: Arc<ApiClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            requires_session: false,
            _marker: PhantomData,
        }
    }

    /// Per-user list: without an active session it serves one empty last
    /// page and never reaches the network
    pub fn authenticated(client: Arc<ApiClient>, path: impl Into<String>) -> Self {
        Self {
            requires_session: true,
            ..Self::new(client, path)
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + Sync> PageSource<T> for ListEndpoint<T> {
    async fn fetch_page(&self, query: &QueryParams) -> SyncResult<RawPage<T>> {
        if self.requires_session && !self.client.session().is_active() {
            debug!("No active session, not fetching {}", self.path);
            return Ok(RawPage {
                items: Vec::new(),
                link: None,
            });
        }

        let response = self
            .client
            .fetch(ApiRequest::get(self.path.clone()).with_query(query.clone()))
            .await?;

        let items: Vec<T> = response.json()?;
        let link = response.header("link").map(str::to_string);

        Ok(RawPage { items, link })
    }
}
