//! Read-state tracking
//!
//! A conversation is marked read when it is actually being looked at:
//! once after its history finished loading, and once per message that
//! arrives while it is the open view. Messages for any other conversation
//! are received but not seen, and never trigger a mark.
//!
//! Marks are fire-and-forget. A failed mark is logged and nothing else;
//! it never holds up the message display.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::models::Message;

/// Why a conversation is being marked read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTrigger {
    HistoryLoaded,
    MessageWhileViewing,
}

pub struct ReadStateTracker {
    api: Arc<dyn ChatApi>,
}

impl ReadStateTracker {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    pub fn on_history_loaded(&self, conversation_id: &str) {
        self.mark(conversation_id, ReadTrigger::HistoryLoaded);
    }

    /// Returns whether a mark was issued for `message`
    pub fn on_incoming(&self, message: &Message, active: Option<&str>) -> bool {
        if !is_seen(message, active) {
            return false;
        }
        self.mark(&message.conversation_id, ReadTrigger::MessageWhileViewing);
        true
    }

    fn mark(&self, conversation_id: &str, trigger: ReadTrigger) {
        debug!("Marking {} read ({:?})", conversation_id, trigger);

        let api = self.api.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&conversation_id).await {
                warn!("Failed to mark {} read: {}", conversation_id, e);
            }
        });
    }
}

/// A message is seen only when its conversation is the open one
pub fn is_seen(message: &Message, active: Option<&str>) -> bool {
    active == Some(message.conversation_id.as_str())
}
