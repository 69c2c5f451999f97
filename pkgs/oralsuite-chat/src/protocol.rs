//! Realtime wire format
//!
//! Every WebSocket text frame is a JSON envelope of the form
//! `{"event": "<name>", "data": <payload>}`.
//!
//! | Direction | Event                | Payload                          |
//! |-----------|----------------------|----------------------------------|
//! | out       | `join_conversation`  | conversation id                  |
//! | out       | `leave_conversation` | conversation id                  |
//! | out       | `send_message`       | `{conversationId, content}`      |
//! | out       | `typing`             | `{conversationId, isTyping}`     |
//! | in        | `new_message`        | full message record              |
//! | in        | `user_typing`        | `{userId, isTyping}`             |

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Message, SendMessageRequest, TypingSignal, TypingUpdate};

/// Frames the client emits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinConversation(String),
    LeaveConversation(String),
    SendMessage(SendMessageRequest),
    Typing(TypingSignal),
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::JoinConversation(_) => "join_conversation",
            ClientFrame::LeaveConversation(_) => "leave_conversation",
            ClientFrame::SendMessage(_) => "send_message",
            ClientFrame::Typing(_) => "typing",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames pushed by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    NewMessage(Message),
    UserTyping(TypingUpdate),
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_envelope() {
        let frame = ClientFrame::JoinConversation("c1".to_string());
        assert_eq!(
            frame.encode().unwrap(),
            r#"{"event":"join_conversation","data":"c1"}"#
        );
    }

    #[test]
    fn test_typing_frame_envelope() {
        let frame = ClientFrame::Typing(TypingSignal::stop("c9"));
        assert_eq!(
            frame.encode().unwrap(),
            r#"{"event":"typing","data":{"conversationId":"c9","isTyping":false}}"#
        );
    }

    #[test]
    fn test_decode_user_typing() {
        let frame =
            ServerFrame::decode(r#"{"event":"user_typing","data":{"userId":"u2","isTyping":true}}"#)
                .unwrap();
        assert_eq!(
            frame,
            ServerFrame::UserTyping(TypingUpdate {
                user_id: "u2".into(),
                is_typing: true,
                conversation_id: None,
            })
        );
    }

    #[test]
    fn test_decode_unknown_event_fails() {
        assert!(ServerFrame::decode(r#"{"event":"presence","data":{}}"#).is_err());
    }
}
