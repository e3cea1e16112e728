//! Chats and chat messages.
//!
//! - The chat list is a [`ChatList`]: paginated chats plus chats and last
//!   message ids learned from pushes, ordered by last message
//! - Messages live in one scoped collection per open chat, held in a
//!   [`CollectionRegistry`] and disposed when the last reader lets go
//! - Pushed messages are applied in arrival order by a single worker

pub mod grouping;
pub mod list;

pub use grouping::{group_by_date, DateGroup, MessageChunk};
pub use list::ChatList;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiRequest, ListEndpoint, ReplayPolicy};
use crate::model::{Chat, ChatId, ChatMessage, MessageId};
use crate::push::{PushChannel, PushKind, PushMessage, Subscription};
use crate::sync::{
    CollectionLease, CollectionRegistry, CursorPaginator, LiveMergeCollection, QueryParams,
    SyncResult, SyncedCollection, ViewOrder,
};

pub const CHATS_PATH: &str = "/v1/me/chats";

pub type MessageCollection = SyncedCollection<ChatMessage>;
pub type MessageLease = CollectionLease<ChatId, MessageCollection>;

type MessageRegistry = CollectionRegistry<ChatId, MessageCollection>;
type PendingChat = Shared<BoxFuture<'static, SyncResult<Chat>>>;
type PendingSeen = Shared<BoxFuture<'static, SyncResult<Option<ChatMessage>>>>;

pub fn chat_path(chat_id: &str) -> String {
    format!("{}/{}", CHATS_PATH, chat_id)
}

pub fn messages_path(chat_id: &str) -> String {
    format!("{}/{}/messages", CHATS_PATH, chat_id)
}

/// Chat list plus per-chat message collections
pub struct ChatSync {
    client: Arc<ApiClient>,
    chats: Arc<ChatList>,
    messages: Arc<MessageRegistry>,
    pending_chats: DashMap<ChatId, PendingChat>,
    pending_seen: DashMap<MessageId, PendingSeen>,
}

impl ChatSync {
    pub fn new(client: Arc<ApiClient>, page_size: u32) -> Self {
        let chats = ChatList::new(CursorPaginator::new(
            "chats",
            Arc::new(ListEndpoint::<Chat>::authenticated(client.clone(), CHATS_PATH)),
            QueryParams::new().with("n", page_size),
        ));

        let factory_client = client.clone();
        let messages = CollectionRegistry::new("chat-messages", move |chat_id: &ChatId| {
            SyncedCollection::new(
                CursorPaginator::new(
                    format!("chat-{}-messages", chat_id),
                    Arc::new(ListEndpoint::<ChatMessage>::authenticated(
                        factory_client.clone(),
                        messages_path(chat_id),
                    )),
                    QueryParams::new().with("n", page_size),
                ),
                LiveMergeCollection::scoped(chat_id.clone(), ViewOrder::descending_id()),
            )
        });

        Self {
            client,
            chats: Arc::new(chats),
            messages: Arc::new(messages),
            pending_chats: DashMap::new(),
            pending_seen: DashMap::new(),
        }
    }

    /// The chat list, newest activity first
    pub fn chats(&self) -> &Arc<ChatList> {
        &self.chats
    }

    /// Open the message collection of `chat_id`; it stays alive while any
    /// lease does
    pub fn open_chat(&self, chat_id: impl Into<ChatId>) -> MessageLease {
        self.messages.acquire(chat_id.into())
    }

    /// Message collection of `chat_id` if it is open
    pub fn open_messages(&self, chat_id: &ChatId) -> Option<Arc<MessageCollection>> {
        self.messages.get(chat_id)
    }

    pub fn open_chat_count(&self) -> usize {
        self.messages.len()
    }

    /// Chat by id, fetched once if it is not loaded yet.
    ///
    /// Concurrent calls for the same chat share one request.
    pub async fn ensure_chat(&self, chat_id: &ChatId) -> SyncResult<Chat> {
        if let Some(chat) = self.chats.get(chat_id) {
            return Ok(chat);
        }

        let pending = match self.pending_chats.entry(chat_id.clone()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let pending = fetch_chat(self.client.clone(), self.chats.clone(), chat_id.clone())
                    .boxed()
                    .shared();
                vacant.insert(pending.clone());
                pending
            }
        };

        let result = pending.clone().await;
        self.pending_chats
            .remove_if(chat_id, |_, current| current.ptr_eq(&pending));
        result
    }

    /// Fold a message received out of band into the chat list and, if the
    /// chat is open, into its message collection
    pub async fn apply_pushed_message(&self, message: ChatMessage) -> SyncResult<()> {
        let chat = self.ensure_chat(&message.chat_id).await?;

        if message.id > chat.last_message_id {
            self.chats.raise(&chat.id, message.id);
        }

        if let Some(collection) = self.messages.get(&message.chat_id) {
            collection.apply_live(message)?;
        }

        Ok(())
    }

    /// Post a text message; the created message is applied live
    pub async fn send_message(&self, chat_id: &ChatId, text: &str) -> SyncResult<ChatMessage> {
        let message: ChatMessage = self
            .client
            .fetch_json(ApiRequest::post(messages_path(chat_id)).with_json(json!({ "text": text })))
            .await?;

        debug!("Message {} sent in chat {}", message.id, chat_id);
        self.apply_pushed_message(message.clone()).await?;
        Ok(message)
    }

    /// Mark `message` as seen by the current user.
    ///
    /// Returns `None` without calling the API when the message is already
    /// seen or was sent by the current user. Concurrent calls for the same
    /// message share one request.
    pub async fn mark_seen(&self, message: &ChatMessage) -> SyncResult<Option<ChatMessage>> {
        let me = self.client.session().user_id();
        if message.seen || me.map(|me| message.is_sent_by(me)).unwrap_or(false) {
            return Ok(None);
        }

        let pending = match self.pending_seen.entry(message.id) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let pending =
                    post_seen(self.client.clone(), self.messages.clone(), message.clone())
                        .boxed()
                        .shared();
                vacant.insert(pending.clone());
                pending
            }
        };

        let result = pending.clone().await;
        self.pending_seen
            .remove_if(&message.id, |_, current| current.ptr_eq(&pending));
        result
    }

    /// Unseen messages addressed to the current user in an open chat
    pub fn unseen_count(&self, chat_id: &ChatId) -> usize {
        let (Some(me), Some(collection)) =
            (self.client.session().user_id(), self.messages.get(chat_id))
        else {
            return 0;
        };
        collection
            .view()
            .iter()
            .filter(|message| message.is_hot(me))
            .count()
    }

    /// Refetch one chat's messages from the first page
    pub fn invalidate_chat(&self, chat_id: &ChatId) {
        if let Some(collection) = self.messages.get(chat_id) {
            collection.refresh();
        }
    }

    /// Drop every loaded chat and message
    pub fn reset_all(&self) {
        self.chats.clear();
        for collection in self.messages.collections() {
            collection.clear();
        }
        info!("Chat data cleared");
    }

    /// Start applying pushed chat messages
    pub fn attach(self: &Arc<Self>, push: &PushChannel) -> SyncResult<LiveChatFeed> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChatMessage>();

        let mut subscriptions = Vec::new();
        for kind in [PushKind::NewChatMessage, PushKind::UpdatedChatMessage] {
            let tx = tx.clone();
            subscriptions.push(push.subscribe_message(kind, move |message: PushMessage| {
                if let Some(chat_message) = message.chat_message() {
                    let _ = tx.send(chat_message.clone());
                }
            })?);
        }

        let sync = self.clone();
        let worker = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let (id, chat_id) = (message.id, message.chat_id.clone());
                if let Err(e) = sync.apply_pushed_message(message).await {
                    warn!("Failed to apply message {} of chat {}: {}", id, chat_id, e);
                }
            }
            debug!("Live chat worker ended");
        });

        Ok(LiveChatFeed {
            subscriptions,
            worker,
        })
    }
}

async fn fetch_chat(
    client: Arc<ApiClient>,
    chats: Arc<ChatList>,
    chat_id: ChatId,
) -> SyncResult<Chat> {
    debug!("Fetching chat {}", chat_id);
    let chat: Chat = client.fetch_json(ApiRequest::get(chat_path(&chat_id))).await?;
    chats.insert_extra(chat.clone());
    Ok(chat)
}

async fn post_seen(
    client: Arc<ApiClient>,
    messages: Arc<MessageRegistry>,
    message: ChatMessage,
) -> SyncResult<Option<ChatMessage>> {
    let path = format!("{}/{}/see", messages_path(&message.chat_id), message.id);
    let response = client
        .fetch(ApiRequest::post(path).with_replay(ReplayPolicy::Safe))
        .await?;

    let updated = if response.body.is_empty() {
        ChatMessage {
            seen: true,
            ..message
        }
    } else {
        response.json()?
    };

    if let Some(collection) = messages.get(&updated.chat_id) {
        collection.apply_live(updated.clone())?;
    }
    Ok(Some(updated))
}

/// Pushed chat messages flowing into a [`ChatSync`]; stops on drop
pub struct LiveChatFeed {
    subscriptions: Vec<Subscription>,
    worker: JoinHandle<()>,
}

impl LiveChatFeed {
    /// Pause or resume delivery without dropping the feed
    pub fn set_enabled(&self, enabled: bool) -> SyncResult<()> {
        for subscription in &self.subscriptions {
            subscription.set_enabled(enabled)?;
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.subscriptions.iter().all(Subscription::is_enabled)
    }
}

impl Drop for LiveChatFeed {
    fn drop(&mut self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        self.worker.abort();
    }
}
