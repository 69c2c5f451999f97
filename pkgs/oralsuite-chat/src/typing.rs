//! Typing indicators
//!
//! Local side: every content change emits a typing-start and pushes the
//! idle deadline forward. When the deadline passes without further input a
//! single typing-stop is emitted. Sending cancels the pending deadline and
//! emits the stop immediately.
//!
//! Remote side: `user_typing` updates maintain a per-conversation set of
//! typing users. A stop removes the user; a start that is never followed by
//! a stop expires after `remote_typing_ttl`.
//!
//! Both sides are plain state machines driven with explicit instants; the
//! session sleeps until [`TypingCoordinator::next_deadline`].

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::models::TypingSignal;

#[derive(Debug, Clone)]
struct PendingStop {
    conversation_id: String,
    deadline: Instant,
}

/// Debounces local typing into start/stop signals
#[derive(Debug)]
pub struct TypingCoordinator {
    idle_timeout: Duration,
    pending: Option<PendingStop>,
}

impl TypingCoordinator {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            pending: None,
        }
    }

    /// A content change in `conversation_id`. Returns the signals to emit,
    /// in order: a stop for another conversation still pending, then the start.
    pub fn notify_typing(&mut self, conversation_id: &str, now: Instant) -> Vec<TypingSignal> {
        let mut signals = Vec::with_capacity(2);
        if let Some(pending) = &self.pending {
            if pending.conversation_id != conversation_id {
                signals.push(TypingSignal::stop(pending.conversation_id.clone()));
            }
        }

        signals.push(TypingSignal::start(conversation_id));
        self.pending = Some(PendingStop {
            conversation_id: conversation_id.to_string(),
            deadline: now + self.idle_timeout,
        });
        signals
    }

    /// An explicit send always stops typing right away
    pub fn on_send(&mut self, conversation_id: &str) -> TypingSignal {
        if let Some(pending) = self.pending.take() {
            debug!("Typing timer for {} cancelled by send", pending.conversation_id);
        }
        TypingSignal::stop(conversation_id)
    }

    /// Drop the pending timer, e.g. when the conversation is switched.
    /// Returns the stop that would otherwise have been emitted later.
    pub fn cancel(&mut self) -> Option<TypingSignal> {
        self.pending
            .take()
            .map(|pending| TypingSignal::stop(pending.conversation_id))
    }

    /// Fire the idle timer if it is due
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        let due = self.pending.as_ref().is_some_and(|p| p.deadline <= now);
        if due {
            self.cancel()
        } else {
            None
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }
}

/// Users currently typing, per conversation
#[derive(Debug)]
pub struct RemoteTypers {
    ttl: Duration,
    conversations: HashMap<String, Vec<(String, Instant)>>,
}

impl RemoteTypers {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            conversations: HashMap::new(),
        }
    }

    /// Apply an update; returns whether the set changed
    pub fn apply(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if is_typing {
            let typers = self
                .conversations
                .entry(conversation_id.to_string())
                .or_default();
            let expires = now + self.ttl;
            match typers.iter_mut().find(|(id, _)| id == user_id) {
                Some(entry) => {
                    entry.1 = expires;
                    false
                }
                None => {
                    typers.push((user_id.to_string(), expires));
                    true
                }
            }
        } else {
            let Some(typers) = self.conversations.get_mut(conversation_id) else {
                return false;
            };
            let before = typers.len();
            typers.retain(|(id, _)| id != user_id);
            let changed = typers.len() != before;
            if typers.is_empty() {
                self.conversations.remove(conversation_id);
            }
            changed
        }
    }

    /// Typers of `conversation_id` in arrival order, without `local_user_id`
    pub fn visible(&self, conversation_id: &str, local_user_id: &str) -> Vec<String> {
        self.conversations
            .get(conversation_id)
            .map(|typers| {
                typers
                    .iter()
                    .filter(|(id, _)| id != local_user_id)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop typers whose stop never arrived. Returns affected conversations.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let mut affected = Vec::new();
        self.conversations.retain(|conversation_id, typers| {
            let before = typers.len();
            typers.retain(|(_, expires)| *expires > now);
            if typers.len() != before {
                affected.push(conversation_id.clone());
            }
            !typers.is_empty()
        });
        affected
    }

    pub fn clear(&mut self, conversation_id: &str) -> bool {
        self.conversations.remove(conversation_id).is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.conversations
            .values()
            .flat_map(|typers| typers.iter().map(|(_, expires)| *expires))
            .min()
    }
}
