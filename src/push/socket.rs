//! Push connections and the connectors that open them.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::protocol::PushEnvelope;
use super::PushError;

/// Envelopes buffered per listener before it starts lagging
const EVENT_CAPACITY: usize = 256;

/// One open push connection.
///
/// Frames are fanned out to every listener through a broadcast channel.
/// Closing sends the shutdown signal to the reader task, if any.
pub struct PushConnection {
    id: String,
    events: broadcast::Sender<Arc<PushEnvelope>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl PushConnection {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            events,
            shutdown_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PushEnvelope>> {
        self.events.subscribe()
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Fan an envelope out to the listeners; returns how many got it
    pub fn deliver(&self, envelope: PushEnvelope) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.events.send(Arc::new(envelope)).unwrap_or(0)
    }

    /// Parse and deliver a text frame. Malformed frames are logged and skipped.
    pub fn deliver_text(&self, text: &str) -> bool {
        match PushEnvelope::parse(text) {
            Ok(envelope) => {
                debug!("[{}] Push '{}' received", self.id, envelope.tag);
                self.deliver(envelope);
                true
            }
            Err(e) => {
                warn!("[{}] Skipping push frame: {}", self.id, e);
                false
            }
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
            info!("Push connection {} closed", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens push connections
pub trait PushConnector: Send + Sync {
    fn connect(&self) -> Arc<PushConnection>;
}

/// Connector backed by a WebSocket to the API's push endpoint.
///
/// `connect` must be called from within a tokio runtime.
pub struct WebSocketConnector {
    socket_url: String,
    cookie_url: Option<Url>,
    jar: Option<Arc<Jar>>,
}

impl WebSocketConnector {
    pub fn new(socket_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            cookie_url: None,
            jar: None,
        }
    }

    /// Forward the session cookies stored for `api_url` on the upgrade request
    pub fn with_cookies(mut self, jar: Arc<Jar>, api_url: Url) -> Self {
        self.jar = Some(jar);
        self.cookie_url = Some(api_url);
        self
    }

    pub fn socket_url(&self) -> &str {
        &self.socket_url
    }

    fn build_request(&self) -> Result<Request, PushError> {
        let mut request = self
            .socket_url
            .as_str()
            .into_client_request()
            .map_err(|e| PushError::Connect(e.to_string()))?;

        if let (Some(jar), Some(url)) = (&self.jar, &self.cookie_url) {
            if let Some(cookies) = jar.cookies(url) {
                let value = HeaderValue::from_bytes(cookies.as_bytes())
                    .map_err(|e| PushError::Connect(e.to_string()))?;
                request.headers_mut().insert(COOKIE, value);
            }
        }

        Ok(request)
    }
}

impl PushConnector for WebSocketConnector {
    fn connect(&self) -> Arc<PushConnection> {
        let connection = PushConnection::new();

        match self.build_request() {
            Ok(request) => {
                let shutdown = connection.shutdown_receiver();
                tokio::spawn(run_socket(request, connection.clone(), shutdown));
            }
            Err(e) => {
                error!("Cannot open push socket {}: {}", self.socket_url, e);
                connection.mark_closed();
            }
        }

        connection
    }
}

async fn run_socket(
    request: Request,
    connection: Arc<PushConnection>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let uri = request.uri().to_string();

    let stream = tokio::select! {
        result = tokio_tungstenite::connect_async(request) => match result {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!("Push socket {} failed to connect: {}", uri, e);
                connection.mark_closed();
                return;
            }
        },
        _ = shutdown.recv() => {
            debug!("Push socket {} closed before connecting", uri);
            return;
        }
    };

    info!("Push socket {} connected ({})", connection.id(), uri);
    let (mut sink, mut frames) = stream.split();

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    connection.deliver_text(&text);
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("[{}] Ignoring binary push frame", connection.id());
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Push socket {} closed by server", connection.id());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Push socket {} error: {}", connection.id(), e);
                    break;
                }
            },
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    connection.mark_closed();
    debug!("Push socket task ended for {}", connection.id());
}

/// In-process connector; frames are injected with [`PushConnection::deliver_text`]
#[derive(Default)]
pub struct ChannelConnector {
    connections: Mutex<Vec<Arc<PushConnection>>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently opened connection
    pub fn latest(&self) -> Option<Arc<PushConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Deliver a text frame on the latest open connection
    pub fn push_text(&self, text: &str) -> bool {
        match self.latest() {
            Some(connection) if !connection.is_closed() => connection.deliver_text(text),
            _ => false,
        }
    }
}

impl PushConnector for ChannelConnector {
    fn connect(&self) -> Arc<PushConnection> {
        let connection = PushConnection::new();
        self.connections.lock().push(connection.clone());
        connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_fans_out() {
        let connection = PushConnection::new();
        let mut a = connection.subscribe();
        let mut b = connection.subscribe();

        assert!(connection.deliver_text(r#"{"type":"updated_account_validation","validated":true}"#));
        assert!(!connection.deliver_text("{oops"));

        assert_eq!(a.try_recv().unwrap().tag, "updated_account_validation");
        assert_eq!(b.try_recv().unwrap().tag, "updated_account_validation");
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn test_close_signals_shutdown_once() {
        let connection = PushConnection::new();
        let mut shutdown = connection.shutdown_receiver();
        let mut events = connection.subscribe();

        connection.close();
        connection.close();

        assert!(connection.is_closed());
        assert!(shutdown.try_recv().is_ok());
        assert!(shutdown.try_recv().is_err());

        connection.deliver_text(r#"{"type":"new_chat_message"}"#);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_channel_connector_tracks_connections() {
        let connector = ChannelConnector::new();
        assert!(!connector.push_text(r#"{"type":"x"}"#));

        let first = connector.connect();
        first.close();
        let second = connector.connect();

        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.latest().unwrap().id(), second.id());
        assert!(connector.push_text(r#"{"type":"x"}"#));
    }

    #[test]
    fn test_websocket_request_carries_cookies() {
        let api_url = Url::parse("http://localhost:8000/").unwrap();
        let jar = Arc::new(Jar::default());
        jar.add_cookie_str("session=abc123", &api_url);

        let connector = WebSocketConnector::new("ws://localhost:8000/v1/me/websocket")
            .with_cookies(jar, api_url);
        let request = connector.build_request().unwrap();

        assert_eq!(request.uri().path(), "/v1/me/websocket");
        assert_eq!(request.headers().get(COOKIE).unwrap(), "session=abc123");
    }
}
