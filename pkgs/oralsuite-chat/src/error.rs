//! Error types for chat operations

use thiserror::Error;

/// Errors that can occur while talking to the chat backend
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Realtime channel is not connected")]
    NotConnected,
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("No conversation is open")]
    NoActiveConversation,
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Chat session closed")]
    SessionClosed,
}

impl ChatError {
    /// Human readable reason shown in a failed view
    pub fn reason(&self) -> String {
        match self {
            ChatError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the failure came from a rejected credential
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ChatError::Unauthorized(_))
            || matches!(self, ChatError::Api { status: 401, .. })
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
