//! Message synchronizer
//!
//! Merges the two ways a message reaches the client into one ordered log per
//! open conversation:
//!
//! - **History** (REST): arrives newest-first and is reversed before merging.
//! - **Realtime** (push): appended as it arrives; the room stream is ordered.
//!
//! Identity is the message id. A message delivered twice, by either path,
//! is kept once. The log is always sorted by `(created_at, id)`; an arrival
//! older than the tail is placed at its position instead of appended.
//!
//! Outgoing sends go over the realtime channel when connected and are not
//! appended locally: the server echo carries the canonical id and timestamp
//! and populates the log. When disconnected the REST response is appended
//! directly since no echo will come.
//!
//! History loads are keyed by a [`LoadTicket`]; a result whose ticket no
//! longer matches the open view is discarded.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::models::{Conversation, Message};

/// Status of an open conversation view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewStatus {
    Loading,
    Ready,
    Error(String),
}

/// Ordered, duplicate-free message list of one conversation
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Add a message unless its id is already present
    pub fn insert(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        self.ids.insert(message.id.clone());

        match self.messages.last() {
            Some(last) if message.log_order(last) == Ordering::Less => {
                let position = self
                    .messages
                    .partition_point(|m| m.log_order(&message) == Ordering::Less);
                self.messages.insert(position, message);
            }
            _ => self.messages.push(message),
        }
        true
    }

    /// Merge a newest-first history page. Entries already present are
    /// refreshed with the server copy. Returns how many were new.
    pub fn merge_history(&mut self, newest_first: Vec<Message>) -> usize {
        let mut added = 0;
        for message in newest_first.into_iter().rev() {
            if self.ids.contains(&message.id) {
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message;
                }
            } else if self.insert(message) {
                added += 1;
            }
        }
        added
    }
}

/// Identifies one history load request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub conversation_id: String,
    pub generation: u64,
}

/// What happened to a finished history load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Ready { added: usize },
    Failed(String),
    Stale,
}

/// Where an arriving message went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    Appended,
    Duplicate,
    NotActive,
}

/// How an outgoing message travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRoute {
    Realtime,
    Rest,
}

impl SendRoute {
    pub fn for_connection(connected: bool) -> Self {
        if connected {
            SendRoute::Realtime
        } else {
            SendRoute::Rest
        }
    }
}

/// State of the conversation currently on screen
#[derive(Debug, Clone)]
pub struct ConversationView {
    conversation_id: String,
    conversation: Option<Conversation>,
    log: MessageLog,
    status: ViewStatus,
    generation: u64,
}

impl ConversationView {
    fn new(conversation_id: String, generation: u64) -> Self {
        Self {
            conversation_id,
            conversation: None,
            log: MessageLog::new(),
            status: ViewStatus::Loading,
            generation,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn status(&self) -> &ViewStatus {
        &self.status
    }
}

/// Ids seen on the raw incoming stream, bounded
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; false if it was already known
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

const RECENT_IDS_CAPACITY: usize = 4096;

pub struct MessageSynchronizer {
    view: Option<ConversationView>,
    generation: u64,
    seen: RecentIds,
}

impl Default for MessageSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSynchronizer {
    pub fn new() -> Self {
        Self {
            view: None,
            generation: 0,
            seen: RecentIds::new(RECENT_IDS_CAPACITY),
        }
    }

    pub fn view(&self) -> Option<&ConversationView> {
        self.view.as_ref()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.view.as_ref().map(|v| v.conversation_id.as_str())
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active_id() == Some(conversation_id)
    }

    /// Replace the open view with a fresh one in `Loading`
    pub fn open(&mut self, conversation_id: &str) -> LoadTicket {
        self.generation += 1;
        info!("Opening conversation {}", conversation_id);
        self.view = Some(ConversationView::new(
            conversation_id.to_string(),
            self.generation,
        ));
        LoadTicket {
            conversation_id: conversation_id.to_string(),
            generation: self.generation,
        }
    }

    pub fn close(&mut self) -> Option<ConversationView> {
        let view = self.view.take();
        if let Some(view) = &view {
            info!("Closed conversation {}", view.conversation_id);
        }
        view
    }

    /// Start another load of the open view; messages already shown are kept
    pub fn reload(&mut self) -> Option<LoadTicket> {
        self.generation += 1;
        let generation = self.generation;
        let view = self.view.as_mut()?;
        view.generation = generation;
        view.status = ViewStatus::Loading;
        Some(LoadTicket {
            conversation_id: view.conversation_id.clone(),
            generation,
        })
    }

    /// Apply a finished load; results for a view no longer open are dropped
    pub fn apply_load(
        &mut self,
        ticket: &LoadTicket,
        result: Result<(Conversation, Vec<Message>)>,
    ) -> LoadOutcome {
        let Some(view) = self
            .view
            .as_mut()
            .filter(|v| v.conversation_id == ticket.conversation_id && v.generation == ticket.generation)
        else {
            debug!(
                "Discarding stale history for {} (load {})",
                ticket.conversation_id, ticket.generation
            );
            return LoadOutcome::Stale;
        };

        match result {
            Ok((conversation, newest_first)) => {
                let added = view.log.merge_history(newest_first);
                for message in view.log.messages() {
                    self.seen.insert(&message.id);
                }
                view.conversation = Some(conversation);
                view.status = ViewStatus::Ready;
                info!(
                    "Loaded {} messages for {}",
                    view.log.len(),
                    view.conversation_id
                );
                LoadOutcome::Ready { added }
            }
            Err(e) => {
                warn!("Failed to load {}: {}", view.conversation_id, e);
                let reason = e.reason();
                view.status = ViewStatus::Error(reason.clone());
                LoadOutcome::Failed(reason)
            }
        }
    }

    /// First sighting of `message` on the raw incoming stream?
    ///
    /// Messages already in the open log count as seen.
    pub fn first_sighting(&mut self, message: &Message) -> bool {
        if self
            .view
            .as_ref()
            .is_some_and(|v| v.log.contains(&message.id))
        {
            self.seen.insert(&message.id);
            return false;
        }
        self.seen.insert(&message.id)
    }

    /// Put a pushed message into the open log if it belongs there
    pub fn apply_incoming(&mut self, message: Message) -> Incoming {
        self.append(message)
    }

    /// Record the canonical message returned by the REST fallback
    pub fn apply_sent(&mut self, message: Message) -> Incoming {
        self.seen.insert(&message.id);
        self.append(message)
    }

    fn append(&mut self, message: Message) -> Incoming {
        match self.view.as_mut() {
            Some(view) if view.conversation_id == message.conversation_id => {
                if view.log.insert(message) {
                    Incoming::Appended
                } else {
                    Incoming::Duplicate
                }
            }
            _ => Incoming::NotActive,
        }
    }

    /// Validate an outgoing message against the open view
    pub fn outgoing_target(&self) -> Result<String> {
        self.active_id()
            .map(str::to_string)
            .ok_or(ChatError::NoActiveConversation)
    }
}
