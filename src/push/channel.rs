//! Tag-filtered subscriptions over the shared push connection.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::protocol::{PushEnvelope, PushKind, PushMessage};
use super::socket::{PushConnection, PushConnector};
use crate::sync::{RefCountedResource, SyncResult};

type Handler = Arc<dyn Fn(Arc<PushEnvelope>) + Send + Sync>;
type SharedConnection = Arc<RefCountedResource<Arc<PushConnection>>>;

/// Entry point for push subscriptions.
///
/// Cloning is cheap; clones share the same underlying connection.
#[derive(Clone)]
pub struct PushChannel {
    connection: SharedConnection,
}

impl PushChannel {
    pub fn new(connector: Arc<dyn PushConnector>) -> Self {
        let connection = RefCountedResource::new(
            move || connector.connect(),
            |connection: Arc<PushConnection>| connection.close(),
        );
        Self {
            connection: Arc::new(connection),
        }
    }

    /// Deliver every envelope tagged `tag` to `handler`, in arrival order.
    ///
    /// A disabled subscription holds no reference on the connection until
    /// [`Subscription::set_enabled`] turns it on.
    pub fn subscribe(
        &self,
        tag: impl Into<String>,
        handler: impl Fn(Arc<PushEnvelope>) + Send + Sync + 'static,
        enabled: bool,
    ) -> SyncResult<Subscription> {
        let subscription = Subscription {
            tag: tag.into(),
            handler: Arc::new(handler),
            connection: self.connection.clone(),
            state: Mutex::new(SubscriptionState::default()),
        };
        subscription.set_enabled(enabled)?;
        Ok(subscription)
    }

    /// Typed variant of [`subscribe`](Self::subscribe); undecodable
    /// payloads are logged and skipped
    pub fn subscribe_message(
        &self,
        kind: PushKind,
        handler: impl Fn(PushMessage) + Send + Sync + 'static,
    ) -> SyncResult<Subscription> {
        self.subscribe(
            kind.tag(),
            move |envelope: Arc<PushEnvelope>| match envelope.decode() {
                Ok(message) => handler(message),
                Err(e) => warn!("Dropping '{}' push: {}", envelope.tag, e),
            },
            true,
        )
    }

    /// Number of enabled subscriptions holding the connection
    pub fn holders(&self) -> usize {
        self.connection.count()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_live()
    }
}

#[derive(Default)]
struct SubscriptionState {
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

/// Handle of one push subscription; unsubscribes on drop
pub struct Subscription {
    tag: String,
    handler: Handler,
    connection: SharedConnection,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    /// Attach to or detach from the shared connection.
    ///
    /// Detaching releases this subscription's reference only; other
    /// subscribers keep receiving. No-op after `unsubscribe`.
    pub fn set_enabled(&self, enabled: bool) -> SyncResult<()> {
        let mut state = self.state.lock();

        if state.closed {
            return Ok(());
        }

        match (enabled, state.listener.is_some()) {
            (true, false) => {
                let connection = self.connection.acquire()?;
                state.listener = Some(self.spawn_listener(&connection));
                debug!("Push subscription '{}' enabled", self.tag);
            }
            (false, true) => {
                if let Some(listener) = state.listener.take() {
                    listener.abort();
                }
                self.release();
                debug!("Push subscription '{}' disabled", self.tag);
            }
            _ => {}
        }

        Ok(())
    }

    /// Stop for good. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let mut state = self.state.lock();

        if state.closed {
            return;
        }
        state.closed = true;

        if let Some(listener) = state.listener.take() {
            listener.abort();
            self.release();
        }
    }

    fn spawn_listener(&self, connection: &PushConnection) -> JoinHandle<()> {
        let mut events = connection.subscribe();
        let tag = self.tag.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(envelope) => {
                        if envelope.tag == tag {
                            handler(envelope);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Push subscription '{}' lagged, {} frames lost", tag, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn release(&self) {
        if let Err(e) = self.connection.release() {
            error!("Push subscription '{}' release failed: {}", self.tag, e);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::socket::ChannelConnector;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const VALIDATED: &str = r#"{"type":"updated_account_validation","validated":true}"#;
    const OTHER: &str = r#"{"type":"item_liked","item_id":3}"#;

    fn channel() -> (PushChannel, Arc<ChannelConnector>) {
        let connector = Arc::new(ChannelConnector::new());
        (PushChannel::new(connector.clone()), connector)
    }

    fn collecting(tx: mpsc::UnboundedSender<String>) -> impl Fn(Arc<PushEnvelope>) + Send + Sync {
        move |envelope: Arc<PushEnvelope>| {
            let _ = tx.send(envelope.body.to_string());
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_filters_by_tag() {
        let (channel, connector) = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = channel
            .subscribe("updated_account_validation", collecting(tx), true)
            .unwrap();

        connector.push_text(OTHER);
        connector.push_text(VALIDATED);

        let received = next(&mut rx).await.unwrap();
        assert!(received.contains("validated"));
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_socket_lifecycle_follows_subscriptions() {
        let (channel, connector) = channel();
        let (tx, _rx) = mpsc::unbounded_channel();

        let a = channel.subscribe("a", collecting(tx.clone()), true).unwrap();
        let b = channel.subscribe("b", collecting(tx.clone()), true).unwrap();
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(channel.holders(), 2);

        a.unsubscribe();
        a.unsubscribe();
        assert_eq!(channel.holders(), 1);
        assert!(!connector.latest().unwrap().is_closed());

        drop(b);
        assert_eq!(channel.holders(), 0);
        assert!(!channel.is_connected());
        assert!(connector.latest().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_disable_keeps_other_subscribers() {
        let (channel, connector) = channel();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = channel
            .subscribe("updated_account_validation", collecting(tx_a), true)
            .unwrap();
        let _b = channel
            .subscribe("updated_account_validation", collecting(tx_b), true)
            .unwrap();

        a.set_enabled(false).unwrap();
        assert!(!a.is_enabled());
        assert_eq!(connector.connect_count(), 1);

        connector.push_text(VALIDATED);
        assert!(next(&mut rx_b).await.is_some());
        assert!(tokio::time::timeout(Duration::from_millis(50), rx_a.recv())
            .await
            .map(|msg| msg.is_none())
            .unwrap_or(true));

        a.set_enabled(true).unwrap();
        connector.push_text(VALIDATED);
        assert!(next(&mut rx_a).await.is_some());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_subscription_does_not_connect() {
        let (channel, connector) = channel();
        let (tx, _rx) = mpsc::unbounded_channel();

        let sub = channel.subscribe("a", collecting(tx), false).unwrap();
        assert_eq!(connector.connect_count(), 0);

        sub.set_enabled(true).unwrap();
        assert_eq!(connector.connect_count(), 1);

        sub.unsubscribe();
        sub.set_enabled(true).unwrap();
        assert!(!sub.is_enabled());
        assert_eq!(channel.holders(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_message_decodes() {
        let (channel, connector) = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = channel
            .subscribe_message(PushKind::UpdatedAccountValidation, move |message| {
                let _ = tx.send(message);
            })
            .unwrap();

        connector.push_text(r#"{"type":"updated_account_validation"}"#);
        connector.push_text(VALIDATED);

        let message = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, PushMessage::UpdatedAccountValidation { validated: true });
    }
}
