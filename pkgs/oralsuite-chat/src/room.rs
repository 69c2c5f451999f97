//! Room membership
//!
//! A room is the realtime subscription scope of one conversation. The client
//! holds at most one room at a time: switching always leaves the previous
//! room before joining the next one.
//!
//! Membership is not remembered across reconnects. A drop of the channel
//! forgets the joined room; the session re-issues `join` on the next
//! connected transition if a conversation is still open.

use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::protocol::ClientFrame;

#[derive(Debug, Default)]
pub struct RoomMembership {
    joined: Option<String>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self { joined: None }
    }

    /// The room currently subscribed, if any
    pub fn joined(&self) -> Option<&str> {
        self.joined.as_deref()
    }

    /// Join `conversation_id`, leaving whatever room was held before.
    /// Returns false when the channel is not connected.
    pub fn join(&mut self, conversation_id: &str, connection: &ConnectionManager) -> bool {
        if self.joined.as_deref() == Some(conversation_id) {
            return true;
        }
        self.leave(connection);

        if !connection.is_connected() {
            debug!("Not connected, room {} not joined", conversation_id);
            return false;
        }
        match connection.emit(ClientFrame::JoinConversation(conversation_id.to_string())) {
            Ok(()) => {
                info!("Joined room {}", conversation_id);
                self.joined = Some(conversation_id.to_string());
                true
            }
            Err(e) => {
                debug!("Failed to join room {}: {}", conversation_id, e);
                false
            }
        }
    }

    /// Leave the held room. The local membership is cleared even when the
    /// leave signal cannot be delivered.
    pub fn leave(&mut self, connection: &ConnectionManager) -> Option<String> {
        let previous = self.joined.take()?;
        match connection.emit(ClientFrame::LeaveConversation(previous.clone())) {
            Ok(()) => info!("Left room {}", previous),
            Err(e) => debug!("Leave for room {} not delivered: {}", previous, e),
        }
        Some(previous)
    }

    /// Forget membership after the channel dropped
    pub fn reset(&mut self) {
        if let Some(previous) = self.joined.take() {
            debug!("Membership of room {} lost with the channel", previous);
        }
    }
}
