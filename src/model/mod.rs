//! Records served by the marketplace API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::Entity;

pub type UserId = i64;
pub type ChatId = String;
pub type MessageId = i64;
pub type ItemId = i64;

/// Public profile of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub avatar_seed: Option<String>,
}

/// The authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub validated: bool,
}

/// Kind of a chat message; everything but `Text` is generated by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    LoanRequestCreated,
    LoanRequestCancelled,
    LoanRequestAccepted,
    LoanRequestRejected,
    LoanStarted,
    LoanEnded,
    ItemNotAvailable,
    ItemAvailable,
    #[serde(other)]
    Other,
}

/// Who a message should be attributed to in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    Me,
    Interlocutor,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub message_type: MessageType,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

impl ChatMessage {
    pub fn origin(&self, me: UserId) -> MessageOrigin {
        match self.message_type {
            MessageType::Text if self.sender_id == Some(me) => MessageOrigin::Me,
            MessageType::Text => MessageOrigin::Interlocutor,
            _ => MessageOrigin::System,
        }
    }

    /// Addressed to `me` and not seen yet
    pub fn is_hot(&self, me: UserId) -> bool {
        !self.seen && self.receiver_id == Some(me)
    }

    pub fn is_sent_by(&self, user: UserId) -> bool {
        self.sender_id == Some(user)
    }
}

impl Entity for ChatMessage {
    type Id = MessageId;
    type ParentId = ChatId;

    fn id(&self) -> MessageId {
        self.id
    }

    fn parent_id(&self) -> Option<ChatId> {
        Some(self.chat_id.clone())
    }
}

/// Conversation between an item owner and a would-be borrower
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub item_id: ItemId,
    pub borrower: User,
    pub owner: User,
    pub last_message_id: MessageId,
}

impl Chat {
    /// The other member of the chat, from `me`'s point of view
    pub fn interlocutor(&self, me: UserId) -> &User {
        if self.owner.id == me {
            &self.borrower
        } else {
            &self.owner
        }
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.owner.id == user || self.borrower.id == user
    }
}

/// Loan request created when a user asks to borrow an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRequest {
    pub id: i64,
    /// Chat where the request is discussed
    pub chat_id: ChatId,
    #[serde(default)]
    pub borrower: Option<User>,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub targeted_age_months: Vec<Option<u32>>,
    pub available: bool,
    pub owner_id: UserId,
    #[serde(default)]
    pub likes_count: u32,
}

impl Entity for Item {
    type Id = ItemId;
    type ParentId = ();

    fn id(&self) -> ItemId {
        self.id
    }
}
