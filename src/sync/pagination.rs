//! Cursor pagination over list endpoints.
//!
//! A [`CursorPaginator`] fetches one page at a time, derives the next cursor
//! from the response `link` header and accumulates pages in fetch order.
//!
//! Concurrency rules:
//! - At most one fetch is outstanding per paginator; concurrent callers join it
//! - A reset aborts the outstanding fetch and bumps the generation, so a late
//!   response from before the reset is dropped instead of appended
//! - Failures are stored as state and never flip the terminal flag

use async_trait::async_trait;
use futures_util::future::{AbortHandle, Abortable, Aborted, BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::link::next_cursor;
use super::{QueryParams, SyncError, SyncResult};

/// Raw result of one list request
#[derive(Debug, Clone)]
pub struct RawPage<T> {
    pub items: Vec<T>,
    /// Value of the `link` response header, if any
    pub link: Option<String>,
}

/// Something that can serve pages of a list endpoint
#[async_trait]
pub trait PageSource<T>: Send + Sync {
    async fn fetch_page(&self, query: &QueryParams) -> SyncResult<RawPage<T>>;
}

/// One fetched page
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor derived from this page's response; `None` on the last page
    pub cursor: Option<QueryParams>,
    pub is_terminal: bool,
}

/// Fetch status of a paginator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

struct InFlight {
    future: Shared<BoxFuture<'static, ()>>,
    abort: AbortHandle,
}

struct PaginatorState<T> {
    base_query: QueryParams,
    pages: Vec<Page<T>>,
    cursor: Option<QueryParams>,
    terminal: bool,
    status: FetchStatus,
    error: Option<SyncError>,
    generation: u64,
    in_flight: Option<InFlight>,
}

struct PaginatorInner<T> {
    label: String,
    source: Arc<dyn PageSource<T>>,
    state: Mutex<PaginatorState<T>>,
    revision: watch::Sender<u64>,
}

impl<T> PaginatorInner<T> {
    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn settle(&self, generation: u64, result: Result<SyncResult<RawPage<T>>, Aborted>) {
        {
            let mut state = self.state.lock();

            if state.generation != generation {
                debug!("[{}] Dropping page response from before reset", self.label);
                return;
            }
            state.in_flight = None;

            match result {
                Ok(Ok(raw)) => {
                    let cursor = match next_cursor(raw.link.as_deref()) {
                        Ok(cursor) => cursor,
                        Err(e) => {
                            warn!("[{}] Unparseable link header, stopping: {}", self.label, e);
                            None
                        }
                    };
                    let is_terminal = cursor.is_none();

                    debug!(
                        "[{}] Page {} loaded: {} items{}",
                        self.label,
                        state.pages.len() + 1,
                        raw.items.len(),
                        if is_terminal { " (last)" } else { "" }
                    );

                    state.pages.push(Page {
                        items: raw.items,
                        cursor: cursor.clone(),
                        is_terminal,
                    });
                    state.cursor = cursor;
                    state.terminal = is_terminal;
                    state.status = FetchStatus::Success;
                }
                Ok(Err(e)) => {
                    warn!("[{}] Page fetch failed: {}", self.label, e);
                    state.status = FetchStatus::Error;
                    state.error = Some(e);
                }
                Err(Aborted) => {
                    state.status = FetchStatus::Idle;
                }
            }
        }

        self.bump();
    }
}

/// Accumulates the pages of one list endpoint
pub struct CursorPaginator<T> {
    inner: Arc<PaginatorInner<T>>,
}

impl<T> Clone for CursorPaginator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> CursorPaginator<T> {
    pub fn new(
        label: impl Into<String>,
        source: Arc<dyn PageSource<T>>,
        base_query: QueryParams,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(PaginatorInner {
                label: label.into(),
                source,
                state: Mutex::new(PaginatorState {
                    base_query,
                    pages: Vec::new(),
                    cursor: None,
                    terminal: false,
                    status: FetchStatus::Idle,
                    error: None,
                    generation: 0,
                    in_flight: None,
                }),
                revision,
            }),
        }
    }

    /// Fetch the next page.
    ///
    /// Returns immediately once the last page has been reached. While a
    /// fetch is outstanding, callers wait on that same fetch. Failures are
    /// recorded in [`error`](Self::error); calling again retries the same
    /// cursor.
    pub async fn load_more(&self) {
        let future = {
            let mut state = self.inner.state.lock();

            if state.terminal {
                return;
            }

            let joined = state.in_flight.as_ref().map(|f| f.future.clone());
            match joined {
                Some(future) => future,
                None => {
                    let generation = state.generation;
                    let query = match &state.cursor {
                        Some(cursor) => state.base_query.merged_with(cursor),
                        None => state.base_query.clone(),
                    };

                    let (abort, registration) = AbortHandle::new_pair();
                    let inner = self.inner.clone();
                    let future = async move {
                        let fetch = inner.source.fetch_page(&query);
                        let result = Abortable::new(fetch, registration).await;
                        inner.settle(generation, result);
                    }
                    .boxed()
                    .shared();

                    state.status = FetchStatus::Pending;
                    state.error = None;
                    state.in_flight = Some(InFlight {
                        future: future.clone(),
                        abort,
                    });
                    drop(state);
                    self.inner.bump();

                    future
                }
            }
        };

        future.await;
    }

    /// Drop every page and start over with `query`
    pub fn reset(&self, query: QueryParams) {
        {
            let mut state = self.inner.state.lock();

            if let Some(in_flight) = state.in_flight.take() {
                in_flight.abort.abort();
                debug!("[{}] Aborted in-flight page fetch", self.inner.label);
            }

            state.generation += 1;
            state.base_query = query;
            state.pages.clear();
            state.cursor = None;
            state.terminal = false;
            state.status = FetchStatus::Idle;
            state.error = None;
        }

        self.inner.bump();
    }

    /// Reset keeping the current base query
    pub fn refresh(&self) {
        let query = self.base_query();
        self.reset(query);
    }

    /// Flattened items, in fetch order
    pub fn items(&self) -> Vec<T> {
        self.inner
            .state
            .lock()
            .pages
            .iter()
            .flat_map(|page| page.items.iter().cloned())
            .collect()
    }

    pub fn pages(&self) -> Vec<Page<T>> {
        self.inner.state.lock().pages.clone()
    }

    pub fn page_count(&self) -> usize {
        self.inner.state.lock().pages.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.state.lock().terminal
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().in_flight.is_some()
    }

    pub fn status(&self) -> FetchStatus {
        self.inner.state.lock().status
    }

    /// Last fetch failure, cleared when a new fetch starts
    pub fn error(&self) -> Option<SyncError> {
        self.inner.state.lock().error.clone()
    }

    pub fn base_query(&self) -> QueryParams {
        self.inner.state.lock().base_query.clone()
    }

    /// Cursor the next fetch will use
    pub fn cursor(&self) -> Option<QueryParams> {
        self.inner.state.lock().cursor.clone()
    }

    /// Revision counter bumped on every state change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Page source replaying scripted responses, optionally gated
    pub(crate) struct ScriptedSource<T> {
        pub responses: Mutex<VecDeque<SyncResult<RawPage<T>>>>,
        pub queries: Mutex<Vec<QueryParams>>,
        pub calls: AtomicUsize,
        pub gate: Option<Arc<Notify>>,
    }

    impl<T> ScriptedSource<T> {
        pub fn new(responses: Vec<SyncResult<RawPage<T>>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                queries: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        pub fn gated(responses: Vec<SyncResult<RawPage<T>>>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(responses)
            }
        }
    }

    #[async_trait]
    impl<T: Send + Sync> PageSource<T> for ScriptedSource<T> {
        async fn fetch_page(&self, query: &QueryParams) -> SyncResult<RawPage<T>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Transport("no scripted page".to_string())))
        }
    }

    pub(crate) fn page<T>(items: Vec<T>, next: Option<&str>) -> SyncResult<RawPage<T>> {
        Ok(RawPage {
            items,
            link: next.map(|q| format!("</v1/items?{}>; rel=\"next\"", q)),
        })
    }

    fn paginator(source: Arc<ScriptedSource<u32>>) -> CursorPaginator<u32> {
        CursorPaginator::new("test", source, QueryParams::new().with("n", 32))
    }

    #[tokio::test]
    async fn test_pagination_terminates() {
        let source = Arc::new(ScriptedSource::new(vec![
            page((0..32).collect(), Some("n=32&cid=A")),
            page((32..42).collect(), None),
        ]));
        let paginator = paginator(source.clone());

        paginator.load_more().await;
        assert!(!paginator.is_terminal());
        paginator.load_more().await;
        assert!(paginator.is_terminal());
        assert_eq!(paginator.items().len(), 42);
        assert_eq!(paginator.items(), (0..42).collect::<Vec<_>>());

        paginator.load_more().await;
        paginator.load_more().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let queries = source.queries.lock();
        assert_eq!(queries[0].get("cid"), None);
        assert_eq!(queries[1].get("cid"), Some("A"));
        assert_eq!(queries[1].get("n"), Some("32"));
    }

    #[tokio::test]
    async fn test_concurrent_load_more_single_fetch() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(ScriptedSource::gated(
            vec![page(vec![1, 2, 3], Some("cid=3"))],
            gate.clone(),
        ));
        let paginator = paginator(source.clone());

        tokio::join!(paginator.load_more(), paginator.load_more(), async {
            tokio::task::yield_now().await;
            gate.notify_one();
        });

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(paginator.page_count(), 1);
        assert_eq!(paginator.status(), FetchStatus::Success);
    }

    #[tokio::test]
    async fn test_failure_keeps_data_and_is_retryable() {
        let source = Arc::new(ScriptedSource::new(vec![
            page(vec![1, 2], Some("cid=2")),
            Err(SyncError::Transport("timed out".to_string())),
            page(vec![3], None),
        ]));
        let paginator = paginator(source.clone());

        paginator.load_more().await;
        paginator.load_more().await;

        assert_eq!(paginator.status(), FetchStatus::Error);
        assert!(matches!(paginator.error(), Some(SyncError::Transport(_))));
        assert!(!paginator.is_terminal());
        assert_eq!(paginator.items(), vec![1, 2]);

        paginator.load_more().await;
        assert!(paginator.error().is_none());
        assert!(paginator.is_terminal());
        assert_eq!(paginator.items(), vec![1, 2, 3]);
        assert_eq!(source.queries.lock()[2].get("cid"), Some("2"));
    }

    #[tokio::test]
    async fn test_reset_drops_stale_response() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(ScriptedSource::gated(
            vec![page(vec![7, 8, 9], Some("cid=9"))],
            gate.clone(),
        ));
        let paginator = paginator(source.clone());

        let background = paginator.clone();
        let task = tokio::spawn(async move { background.load_more().await });

        while source.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        paginator.reset(QueryParams::new().with("n", 16));
        gate.notify_one();
        task.await.unwrap();

        assert_eq!(paginator.page_count(), 0);
        assert!(!paginator.is_terminal());
        assert!(!paginator.is_loading());
        assert_eq!(paginator.status(), FetchStatus::Idle);
        assert_eq!(paginator.base_query().get("n"), Some("16"));
    }

    #[tokio::test]
    async fn test_unparseable_link_is_terminal() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(RawPage {
            items: vec![1],
            link: Some("garbage; rel=next".to_string()),
        })]));
        let paginator = paginator(source.clone());

        paginator.load_more().await;

        assert!(paginator.is_terminal());
        assert!(paginator.error().is_none());
        assert_eq!(paginator.items(), vec![1]);
    }

    #[tokio::test]
    async fn test_revision_bumps_on_changes() {
        let source = Arc::new(ScriptedSource::new(vec![page(vec![1], None)]));
        let paginator = paginator(source);
        let rx = paginator.subscribe();

        paginator.load_more().await;
        let after_load = *rx.borrow();
        assert!(after_load >= 2);

        paginator.refresh();
        assert_eq!(*rx.borrow(), after_load + 1);
    }
}
