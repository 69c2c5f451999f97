//! Conversation and message records exchanged with the backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Role of the authenticated account
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Dentist,
    Laboratory,
}

/// The user this client is running for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: String,
    pub role: Role,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Opaque bearer credential issued by the auth service
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A messaging thread between one dentist and one laboratory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub dentist_id: String,
    pub laboratory_id: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Conversation {
    pub fn key(&self) -> ConversationKey {
        ConversationKey {
            dentist_id: self.dentist_id.clone(),
            laboratory_id: self.laboratory_id.clone(),
            order_id: self.order_id.clone(),
        }
    }

    /// The party on the other side of the thread for `user`
    pub fn counterpart(&self, user: &LocalUser) -> &str {
        match user.role {
            Role::Dentist => &self.laboratory_id,
            Role::Laboratory => &self.dentist_id,
        }
    }
}

/// Uniqueness key of a conversation: one per pairing, or per pairing and order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub dentist_id: String,
    pub laboratory_id: String,
    pub order_id: Option<String>,
}

/// Sender profile embedded in message payloads
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageSender {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl MessageSender {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.email) {
            (Some(first), _) if !first.is_empty() => match &self.last_name {
                Some(last) if !last.is_empty() => format!("{} {}", first, last),
                _ => first.clone(),
            },
            (_, Some(email)) if !email.is_empty() => email.clone(),
            _ => "User".to_string(),
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<MessageSender>,
}

impl Message {
    /// Total order inside a conversation: creation time, then id
    pub fn log_order(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn sender_name(&self) -> String {
        self.sender
            .as_ref()
            .map(MessageSender::display_name)
            .unwrap_or_else(|| "User".to_string())
    }
}

/// Body of `POST /chat/conversations`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub laboratory_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// Body of `POST /chat/messages` and payload of `send_message`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
}

/// Outbound typing intent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: String,
    pub is_typing: bool,
}

impl TypingSignal {
    pub fn start(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            is_typing: true,
        }
    }

    pub fn stop(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            is_typing: false,
        }
    }
}

/// Inbound typing update fanned out to a room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub user_id: String,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Trim user input; `None` means there is nothing to send
pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
