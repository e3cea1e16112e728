//! JSON envelopes delivered over the push socket.
//!
//! Every text frame is one JSON object carrying a `type` tag next to its
//! payload fields:
//!
//! ```text
//! { "type": "new_chat_message", "message": { ...ChatMessage } }
//! { "type": "updated_account_validation", "validated": true }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PushError;
use crate::model::ChatMessage;

pub const TAG_NEW_CHAT_MESSAGE: &str = "new_chat_message";
pub const TAG_UPDATED_CHAT_MESSAGE: &str = "updated_chat_message";
pub const TAG_UPDATED_ACCOUNT_VALIDATION: &str = "updated_account_validation";

/// Frames larger than this are dropped unparsed (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Known push message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    NewChatMessage,
    UpdatedChatMessage,
    UpdatedAccountValidation,
}

impl PushKind {
    pub fn tag(self) -> &'static str {
        match self {
            PushKind::NewChatMessage => TAG_NEW_CHAT_MESSAGE,
            PushKind::UpdatedChatMessage => TAG_UPDATED_CHAT_MESSAGE,
            PushKind::UpdatedAccountValidation => TAG_UPDATED_ACCOUNT_VALIDATION,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            TAG_NEW_CHAT_MESSAGE => Some(PushKind::NewChatMessage),
            TAG_UPDATED_CHAT_MESSAGE => Some(PushKind::UpdatedChatMessage),
            TAG_UPDATED_ACCOUNT_VALIDATION => Some(PushKind::UpdatedAccountValidation),
            _ => None,
        }
    }
}

/// Typed push message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    NewChatMessage { message: ChatMessage },
    UpdatedChatMessage { message: ChatMessage },
    UpdatedAccountValidation { validated: bool },
}

impl PushMessage {
    pub fn kind(&self) -> PushKind {
        match self {
            PushMessage::NewChatMessage { .. } => PushKind::NewChatMessage,
            PushMessage::UpdatedChatMessage { .. } => PushKind::UpdatedChatMessage,
            PushMessage::UpdatedAccountValidation { .. } => PushKind::UpdatedAccountValidation,
        }
    }

    /// Chat message carried by this push, if any
    pub fn chat_message(&self) -> Option<&ChatMessage> {
        match self {
            PushMessage::NewChatMessage { message } | PushMessage::UpdatedChatMessage { message } => {
                Some(message)
            }
            PushMessage::UpdatedAccountValidation { .. } => None,
        }
    }

    pub fn to_text(&self) -> Result<String, PushError> {
        serde_json::to_string(self).map_err(|e| PushError::Malformed(e.to_string()))
    }
}

/// One tagged frame, payload kept as raw JSON
#[derive(Debug, Clone, PartialEq)]
pub struct PushEnvelope {
    pub tag: String,
    pub body: Value,
}

impl PushEnvelope {
    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self, PushError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(PushError::FrameTooLarge(text.len()));
        }

        let body: Value =
            serde_json::from_str(text).map_err(|e| PushError::Malformed(e.to_string()))?;

        let tag = body
            .as_object()
            .ok_or_else(|| PushError::Malformed("frame is not a JSON object".to_string()))?
            .get("type")
            .and_then(Value::as_str)
            .ok_or(PushError::MissingTag)?
            .to_string();

        Ok(Self { tag, body })
    }

    pub fn kind(&self) -> Option<PushKind> {
        PushKind::from_tag(&self.tag)
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag == tag
    }

    /// Decode into a typed message
    pub fn decode(&self) -> Result<PushMessage, PushError> {
        if self.kind().is_none() {
            return Err(PushError::UnknownTag(self.tag.clone()));
        }
        PushMessage::deserialize(&self.body).map_err(|e| PushError::Malformed(e.to_string()))
    }
}
