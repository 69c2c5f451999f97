//! Notification dispatcher
//!
//! Consumes the raw incoming-message stream (every distinct message once,
//! whatever the conversation) and turns messages from other users into
//! notifications: a title naming the sender and a one-line summary cut at
//! `summary_max_chars`. Each notification is handed to an [`AlertSink`]
//! for the audible/visual part.
//!
//! The dispatcher keeps no record of processed message ids; duplicate
//! suppression is the job of the upstream stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::models::Message;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Message,
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub conversation_id: Option<String>,
}

/// A notification before it is stamped and stored
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub conversation_id: Option<String>,
}

/// Sound / desktop alert boundary
pub trait AlertSink: Send + Sync {
    fn alert(&self, notification: &Notification);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, notification: &Notification) {
        info!("{}: {}", notification.title, notification.message);
    }
}

/// Cut `content` to `max_chars` characters, appending `...` when cut
pub fn summarize(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &content[..end]),
        None => content.to_string(),
    }
}

pub struct NotificationDispatcher {
    local_user_id: String,
    capacity: usize,
    summary_max_chars: usize,
    items: VecDeque<Notification>,
    sink: Arc<dyn AlertSink>,
}

impl NotificationDispatcher {
    pub fn new(
        local_user_id: impl Into<String>,
        capacity: usize,
        summary_max_chars: usize,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            capacity,
            summary_max_chars,
            items: VecDeque::with_capacity(capacity),
            sink,
        }
    }

    /// Handle one message from the raw stream
    pub fn on_incoming(&mut self, message: &Message) -> Option<Notification> {
        if message.sender_id == self.local_user_id {
            return None;
        }

        let draft = NotificationDraft {
            title: format!("New message from {}", message.sender_name()),
            message: summarize(&message.content, self.summary_max_chars),
            kind: NotificationKind::Message,
            conversation_id: Some(message.conversation_id.clone()),
        };
        Some(self.add(draft))
    }

    /// Store a notification, newest first, and alert
    pub fn add(&mut self, draft: NotificationDraft) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            title: draft.title,
            message: draft.message,
            kind: draft.kind,
            timestamp: Utc::now(),
            read: false,
            conversation_id: draft.conversation_id,
        };

        self.items.push_front(notification.clone());
        self.items.truncate(self.capacity);
        self.sink.alert(&notification);
        notification
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn mark_read(&mut self, id: Uuid) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for notification in self.items.iter_mut() {
            notification.read = true;
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageSender;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingSink(Mutex<Vec<String>>);

    impl AlertSink for CountingSink {
        fn alert(&self, notification: &Notification) {
            self.0.lock().push(notification.message.clone());
        }
    }

    fn message(sender_id: &str, content: &str) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: "c1".into(),
            sender_id: sender_id.into(),
            content: content.into(),
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
            sender: Some(MessageSender {
                id: sender_id.into(),
                email: None,
                first_name: Some("Laura".into()),
                last_name: Some("Vega".into()),
            }),
        }
    }

    #[test]
    fn test_summarize_truncates_at_limit() {
        let long = "a".repeat(150);
        let summary = summarize(&long, 100);
        assert_eq!(summary.len(), 103);
        assert!(summary.ends_with("..."));

        let exact = "b".repeat(100);
        assert_eq!(summarize(&exact, 100), exact);
    }

    #[test]
    fn test_summarize_counts_characters() {
        let accented = "ñ".repeat(101);
        let summary = summarize(&accented, 100);
        assert_eq!(summary.chars().count(), 103);
    }

    #[test]
    fn test_own_messages_do_not_notify() {
        let sink = Arc::new(CountingSink::default());
        let mut dispatcher = NotificationDispatcher::new("me", 50, 100, sink.clone());

        assert!(dispatcher.on_incoming(&message("me", "hello")).is_none());
        let notification = dispatcher.on_incoming(&message("lab", "crown is ready")).unwrap();

        assert_eq!(notification.title, "New message from Laura Vega");
        assert_eq!(notification.conversation_id.as_deref(), Some("c1"));
        assert_eq!(*sink.0.lock(), vec!["crown is ready".to_string()]);
    }

    #[test]
    fn test_capacity_and_read_tracking() {
        let mut dispatcher = NotificationDispatcher::new("me", 2, 100, Arc::new(LogAlertSink));
        for i in 0..3 {
            dispatcher.on_incoming(&message("lab", &format!("update {}", i)));
        }

        let items = dispatcher.notifications();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].message, "update 2");
        assert_eq!(dispatcher.unread_count(), 2);

        assert!(dispatcher.mark_read(items[1].id));
        assert_eq!(dispatcher.unread_count(), 1);

        dispatcher.mark_all_read();
        assert_eq!(dispatcher.unread_count(), 0);

        dispatcher.clear();
        assert!(dispatcher.notifications().is_empty());
    }
}
