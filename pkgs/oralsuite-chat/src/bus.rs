//! Engine event bus
//!
//! Everything observable about a session is published here. Consumers hold
//! a [`Subscription`]; dropping it unsubscribes.

use tokio::sync::broadcast;
use tracing::warn;

use crate::models::Message;
use crate::notifications::Notification;
use crate::sync::ViewStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The realtime channel went up or down
    ConnectionChanged { connected: bool },
    /// An attempt to open the realtime channel failed; `unauthorized`
    /// means the credential was refused and no retry follows
    ConnectionFailed { reason: String, unauthorized: bool },
    /// A REST call was refused with the current credential
    CredentialRejected { reason: String },
    /// A message seen for the first time, any conversation
    IncomingMessage(Message),
    /// A message entered the log of the open conversation
    MessageAppended {
        conversation_id: String,
        message: Message,
    },
    ViewChanged {
        conversation_id: Option<String>,
        status: Option<ViewStatus>,
    },
    TypingChanged {
        conversation_id: String,
        user_ids: Vec<String>,
    },
    ConversationsChanged,
    Notification(Notification),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; having none is fine
    pub fn publish(&self, event: ChatEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live subscription to [`ChatEvent`]s
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ChatEvent>,
}

impl Subscription {
    /// Next event, or `None` once the session is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagging, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<ChatEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagging, skipped {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}
