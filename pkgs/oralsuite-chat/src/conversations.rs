//! Conversation directory
//!
//! The list shown next to the chat: sorted by latest activity, with
//! per-conversation unread counters. Conversations without any message sort
//! last, newest first by creation time.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::models::{Conversation, LocalUser, Message, Role};

pub struct ConversationDirectory {
    local_user: LocalUser,
    conversations: Vec<Conversation>,
    unread: HashMap<String, u32>,
}

impl ConversationDirectory {
    pub fn new(local_user: LocalUser) -> Self {
        Self {
            local_user,
            conversations: Vec::new(),
            unread: HashMap::new(),
        }
    }

    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    /// Replace the whole list with a fresh server copy
    pub fn replace(&mut self, conversations: Vec<Conversation>) {
        self.conversations = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            self.upsert(conversation);
        }
        self.sort();
    }

    /// Insert a conversation, replacing any entry with the same id or pairing
    pub fn insert(&mut self, conversation: Conversation) {
        self.upsert(conversation);
        self.sort();
    }

    fn upsert(&mut self, conversation: Conversation) {
        let key = conversation.key();
        self.conversations
            .retain(|c| c.id != conversation.id && c.key() != key);
        self.conversations.push(conversation);
    }

    /// Record activity in `conversation_id`. Returns whether the order may
    /// have changed.
    pub fn touch(&mut self, conversation_id: &str, at: DateTime<Utc>) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            debug!("Activity for unknown conversation {}", conversation_id);
            return false;
        };

        if conversation.last_message_at.is_some_and(|last| last >= at) {
            return false;
        }
        conversation.last_message_at = Some(at);
        self.sort();
        true
    }

    /// Count `message` as unread unless it is ours or already on screen
    pub fn record_unread(&mut self, message: &Message, active: Option<&str>) -> bool {
        if message.sender_id == self.local_user.id
            || active == Some(message.conversation_id.as_str())
        {
            return false;
        }
        *self
            .unread
            .entry(message.conversation_id.clone())
            .or_default() += 1;
        true
    }

    pub fn reset_unread(&mut self, conversation_id: &str) -> bool {
        self.unread.remove(conversation_id).is_some()
    }

    pub fn unread(&self, conversation_id: &str) -> u32 {
        self.unread.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn unread_counts(&self) -> HashMap<String, u32> {
        self.unread.clone()
    }

    /// Active conversation the local user already has with `laboratory_id`
    /// (for `order_id`, or the general thread when `None`)
    pub fn find_existing(
        &self,
        laboratory_id: &str,
        order_id: Option<&str>,
    ) -> Option<&Conversation> {
        self.conversations.iter().find(|c| {
            c.is_active
                && c.laboratory_id == laboratory_id
                && c.order_id.as_deref() == order_id
                && match self.local_user.role {
                    Role::Dentist => c.dentist_id == self.local_user.id,
                    Role::Laboratory => c.laboratory_id == self.local_user.id,
                }
        })
    }

    fn sort(&mut self) {
        self.conversations.sort_by(by_activity);
    }
}

fn by_activity(a: &Conversation, b: &Conversation) -> Ordering {
    let activity = match (a.last_message_at, b.last_message_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    activity.then_with(|| b.created_at.cmp(&a.created_at))
}
