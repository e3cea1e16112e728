//! The chat list.
//!
//! Three sources make up the list:
//! - Paginated chats, the server baseline
//! - Chats fetched one by one because a push mentioned them before any page
//!   did; a baseline entry with the same id replaces them
//! - Raised `last_message_id` values from pushed messages, merged with the
//!   baseline as a maximum so a fresher page always wins
//!
//! Entries superseded by the baseline are dropped after each page load.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;
use tracing::debug;

use crate::model::{Chat, ChatId, MessageId};
use crate::sync::{CollectionWatcher, CursorPaginator, FetchStatus, SyncError};

pub struct ChatList {
    paginator: CursorPaginator<Chat>,
    extra: RwLock<BTreeMap<ChatId, Chat>>,
    raised: RwLock<HashMap<ChatId, MessageId>>,
    revision: watch::Sender<u64>,
}

impl ChatList {
    pub fn new(paginator: CursorPaginator<Chat>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            paginator,
            extra: RwLock::new(BTreeMap::new()),
            raised: RwLock::new(HashMap::new()),
            revision,
        }
    }

    /// Chats ordered by last message, newest first
    pub fn view(&self) -> Vec<Chat> {
        let mut chats = self.extra.read().clone();
        for chat in self.paginator.items() {
            chats.insert(chat.id.clone(), chat);
        }

        let raised = self.raised.read();
        let mut view: Vec<Chat> = chats
            .into_values()
            .map(|mut chat| {
                if let Some(last) = raised.get(&chat.id) {
                    chat.last_message_id = chat.last_message_id.max(*last);
                }
                chat
            })
            .collect();

        view.sort_by(|a, b| {
            b.last_message_id
                .cmp(&a.last_message_id)
                .then_with(|| b.id.cmp(&a.id))
        });
        view
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<Chat> {
        self.view().into_iter().find(|chat| &chat.id == chat_id)
    }

    pub fn contains(&self, chat_id: &ChatId) -> bool {
        self.get(chat_id).is_some()
    }

    /// Remember a chat fetched outside of pagination
    pub fn insert_extra(&self, chat: Chat) {
        let changed = {
            let mut extra = self.extra.write();
            if extra.get(&chat.id) == Some(&chat) {
                false
            } else {
                extra.insert(chat.id.clone(), chat);
                true
            }
        };
        if changed {
            self.bump();
        }
    }

    /// Raise the last message of `chat_id` to `message_id`; never lowers it
    pub fn raise(&self, chat_id: &ChatId, message_id: MessageId) -> bool {
        let changed = {
            let mut raised = self.raised.write();
            match raised.get_mut(chat_id) {
                Some(last) if *last >= message_id => false,
                Some(last) => {
                    *last = message_id;
                    true
                }
                None => {
                    raised.insert(chat_id.clone(), message_id);
                    true
                }
            }
        };
        if changed {
            self.bump();
        }
        changed
    }

    pub async fn load_more(&self) {
        self.paginator.load_more().await;
        self.prune();
    }

    /// Refetch from the first page keeping the current query
    pub fn refresh(&self) {
        self.paginator.refresh();
    }

    /// Forget every chat
    pub fn clear(&self) {
        self.paginator.refresh();
        self.extra.write().clear();
        self.raised.write().clear();
        self.bump();
    }

    pub fn is_terminal(&self) -> bool {
        self.paginator.is_terminal()
    }

    pub fn is_loading(&self) -> bool {
        self.paginator.is_loading()
    }

    pub fn status(&self) -> FetchStatus {
        self.paginator.status()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.paginator.error()
    }

    pub fn paginator(&self) -> &CursorPaginator<Chat> {
        &self.paginator
    }

    pub fn watch(&self) -> CollectionWatcher {
        CollectionWatcher::new(self.paginator.subscribe(), self.revision.subscribe())
    }

    /// Drop extra chats and raises the baseline now covers
    fn prune(&self) {
        let baseline: HashMap<ChatId, MessageId> = self
            .paginator
            .items()
            .into_iter()
            .map(|chat| (chat.id, chat.last_message_id))
            .collect();
        if baseline.is_empty() {
            return;
        }

        let mut pruned = 0;
        {
            let mut extra = self.extra.write();
            let before = extra.len();
            extra.retain(|id, _| !baseline.contains_key(id));
            pruned += before - extra.len();
        }
        {
            let mut raised = self.raised.write();
            let before = raised.len();
            raised.retain(|id, last| baseline.get(id).map_or(true, |base| *last > *base));
            pruned += before - raised.len();
        }

        if pruned > 0 {
            debug!("Dropped {} chat overlays superseded by the server", pruned);
            self.bump();
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}
