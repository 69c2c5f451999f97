//! Chat session
//!
//! [`ChatSession`] owns every piece of chat state and runs it on a single
//! task: commands from [`ChatHandle`]s, events from the realtime channel,
//! finished REST calls and typing timers are handled one at a time, so no
//! state is ever shared between tasks. REST calls run on their own tasks and
//! report back as completions.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ChatApi, Page};
use crate::bus::{ChatEvent, EventBus, Subscription};
use crate::config::ChatConfig;
use crate::connection::{ConnectionManager, Transition};
use crate::conversations::ConversationDirectory;
use crate::error::{ChatError, Result};
use crate::models::{
    normalize_content, Conversation, CreateConversationRequest, Credential, LocalUser, Message,
    SendMessageRequest, TypingSignal, TypingUpdate,
};
use crate::notifications::{
    summarize, AlertSink, Notification, NotificationDispatcher, NotificationDraft,
    NotificationKind,
};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::read_state::ReadStateTracker;
use crate::room::RoomMembership;
use crate::sync::{
    Incoming, LoadOutcome, LoadTicket, MessageSynchronizer, SendRoute, ViewStatus,
};
use crate::transport::{ChannelEvent, Connector, TransportEvent};
use crate::typing::{RemoteTypers, TypingCoordinator};

const COMMAND_BUFFER: usize = 100;

/// Result of [`ChatHandle::send`]
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Nothing to send after trimming
    Skipped,
    /// Handed to the realtime channel; the echo will populate the log
    Emitted,
    /// Stored through REST and appended
    Delivered(Message),
}

/// Point-in-time view of the session
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub conversation_id: Option<String>,
    pub conversation: Option<Conversation>,
    pub status: Option<ViewStatus>,
    pub messages: Vec<Message>,
    pub typing_users: Vec<String>,
    pub connected: bool,
    pub unread: HashMap<String, u32>,
}

enum Command {
    Connect(Option<Credential>),
    Disconnect,
    Open(String),
    Close,
    Refresh,
    Send {
        content: String,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    Typing,
    Conversations(oneshot::Sender<Vec<Conversation>>),
    RefreshConversations(oneshot::Sender<Result<Vec<Conversation>>>),
    CreateConversation {
        laboratory_id: String,
        order_id: Option<String>,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    Snapshot(oneshot::Sender<ViewSnapshot>),
    Notifications(oneshot::Sender<Vec<Notification>>),
    MarkNotificationRead(Uuid),
    MarkAllNotificationsRead,
    ClearNotifications,
    Shutdown,
}

enum Completion {
    Loaded {
        ticket: LoadTicket,
        result: Result<(Conversation, Vec<Message>)>,
    },
    Sent {
        result: Result<Message>,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    ConversationsLoaded {
        result: Result<Vec<Conversation>>,
        reply: oneshot::Sender<Result<Vec<Conversation>>>,
    },
    Created {
        result: Result<Conversation>,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    Redelivered {
        request: SendMessageRequest,
        result: Result<Message>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Realtime,
    Rest,
}

pub struct ChatSession {
    config: ChatConfig,
    local_user: LocalUser,
    api: Arc<dyn ChatApi>,
    connection: ConnectionManager,
    rooms: RoomMembership,
    sync: MessageSynchronizer,
    typing: TypingCoordinator,
    remote: RemoteTypers,
    read_state: ReadStateTracker,
    directory: ConversationDirectory,
    notifications: NotificationDispatcher,
    bus: EventBus,
    commands: mpsc::Receiver<Command>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl ChatSession {
    pub fn new(
        config: ChatConfig,
        local_user: LocalUser,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn AlertSink>,
    ) -> (Self, ChatHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, channel_events) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(connector, events_tx);
        let bus = EventBus::new(config.event_capacity);
        let handle = ChatHandle {
            commands: command_tx,
            bus: bus.clone(),
            connected: connection.watch(),
        };

        let session = Self {
            rooms: RoomMembership::new(),
            sync: MessageSynchronizer::new(),
            typing: TypingCoordinator::new(config.typing_idle_timeout),
            remote: RemoteTypers::new(config.remote_typing_ttl),
            read_state: ReadStateTracker::new(api.clone()),
            directory: ConversationDirectory::new(local_user.clone()),
            notifications: NotificationDispatcher::new(
                local_user.id.clone(),
                config.notification_capacity,
                config.summary_max_chars,
                sink,
            ),
            config,
            local_user,
            api,
            connection,
            bus,
            commands,
            channel_events,
            completions_tx,
            completions,
        };
        (session, handle)
    }

    /// Run until [`ChatHandle::shutdown`] or until every handle is dropped
    pub async fn run(mut self) {
        info!("Chat session started for {}", self.local_user.id);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.channel_events.recv() => self.handle_channel_event(event),
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                _ = sleep_until(deadline) => self.handle_timers(),
            }
        }

        self.teardown();
        info!("Chat session stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(credential) => self.connect(credential),
            Command::Disconnect => self.disconnect(),
            Command::Open(conversation_id) => {
                if self.sync.is_active(&conversation_id) {
                    debug!("Conversation {} already open", conversation_id);
                } else {
                    self.switch_to(Some(conversation_id));
                }
            }
            Command::Close => self.switch_to(None),
            Command::Refresh => {
                if let Some(ticket) = self.sync.reload() {
                    self.publish_view();
                    self.spawn_load(ticket);
                }
            }
            Command::Send { content, reply } => self.send(content, reply),
            Command::Typing => self.local_typing(),
            Command::Conversations(reply) => {
                let _ = reply.send(self.directory.list().to_vec());
            }
            Command::RefreshConversations(reply) => self.spawn_list(reply),
            Command::CreateConversation {
                laboratory_id,
                order_id,
                reply,
            } => self.create_conversation(laboratory_id, order_id, reply),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Notifications(reply) => {
                let _ = reply.send(self.notifications.notifications());
            }
            Command::MarkNotificationRead(id) => {
                self.notifications.mark_read(id);
            }
            Command::MarkAllNotificationsRead => self.notifications.mark_all_read(),
            Command::ClearNotifications => self.notifications.clear(),
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self, credential: Option<Credential>) {
        self.rooms.reset();
        let outcome = self.connection.connect(credential.as_ref());
        if outcome.was_connected {
            self.bus
                .publish(ChatEvent::ConnectionChanged { connected: false });
        }
    }

    fn disconnect(&mut self) {
        if let Some(stop) = self.typing.cancel() {
            self.emit_typing(stop);
        }
        self.rooms.leave(&self.connection);
        if self.connection.disconnect() {
            self.bus
                .publish(ChatEvent::ConnectionChanged { connected: false });
        }
    }

    fn teardown(&mut self) {
        self.disconnect();
        self.sync.close();
    }

    /// Make `next` the open conversation, or close the view
    fn switch_to(&mut self, next: Option<String>) {
        if let Some(stop) = self.typing.cancel() {
            self.emit_typing(stop);
        }
        if let Some(previous) = self.sync.active_id().map(str::to_string) {
            if self.remote.clear(&previous) {
                self.publish_typers(&previous);
            }
        }
        self.rooms.leave(&self.connection);

        match next {
            Some(conversation_id) => {
                let ticket = self.sync.open(&conversation_id);
                self.publish_view();
                self.rooms.join(&conversation_id, &self.connection);
                self.spawn_load(ticket);
            }
            None => {
                self.sync.close();
                self.publish_view();
            }
        }
    }

    fn send(&mut self, content: String, reply: oneshot::Sender<Result<SendOutcome>>) {
        let Some(content) = normalize_content(&content) else {
            let _ = reply.send(Ok(SendOutcome::Skipped));
            return;
        };
        let conversation_id = match self.sync.outgoing_target() {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let stop = self.typing.on_send(&conversation_id);
        self.emit_typing(stop);

        let request = SendMessageRequest {
            conversation_id,
            content,
        };
        if SendRoute::for_connection(self.connection.is_connected()) == SendRoute::Realtime {
            match self.connection.emit(ClientFrame::SendMessage(request.clone())) {
                Ok(()) => {
                    let _ = reply.send(Ok(SendOutcome::Emitted));
                    return;
                }
                Err(e) => warn!("Realtime send failed, using REST: {}", e),
            }
        }
        self.spawn_send(request, reply);
    }

    fn local_typing(&mut self) {
        let Some(conversation_id) = self.sync.active_id().map(str::to_string) else {
            return;
        };
        for signal in self.typing.notify_typing(&conversation_id, Instant::now()) {
            self.emit_typing(signal);
        }
    }

    fn emit_typing(&self, signal: TypingSignal) {
        if !self.connection.is_connected() {
            return;
        }
        if let Err(e) = self.connection.emit(ClientFrame::Typing(signal)) {
            debug!("Typing signal not delivered: {}", e);
        }
    }

    fn create_conversation(
        &mut self,
        laboratory_id: String,
        order_id: Option<String>,
        reply: oneshot::Sender<Result<Conversation>>,
    ) {
        if let Some(existing) = self
            .directory
            .find_existing(&laboratory_id, order_id.as_deref())
        {
            debug!("Reusing conversation {}", existing.id);
            let _ = reply.send(Ok(existing.clone()));
            return;
        }

        let request = CreateConversationRequest {
            laboratory_id,
            order_id,
        };
        let api = self.api.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.create_conversation(&request).await;
            let _ = completions.send(Completion::Created { result, reply });
        });
    }

    fn snapshot(&self) -> ViewSnapshot {
        let view = self.sync.view();
        let conversation_id = view.map(|v| v.conversation_id().to_string());
        let typing_users = conversation_id
            .as_deref()
            .map(|id| self.remote.visible(id, &self.local_user.id))
            .unwrap_or_default();

        ViewSnapshot {
            conversation: view.and_then(|v| v.conversation().cloned()),
            status: view.map(|v| v.status().clone()),
            messages: view.map(|v| v.messages().to_vec()).unwrap_or_default(),
            conversation_id,
            typing_users,
            connected: self.connection.is_connected(),
            unread: self.directory.unread_counts(),
        }
    }

    fn spawn_load(&self, ticket: LoadTicket) {
        let api = self.api.clone();
        let completions = self.completions_tx.clone();
        let page = Page::first(self.config.history_page_size);
        tokio::spawn(async move {
            let id = ticket.conversation_id.clone();
            let result = tokio::try_join!(api.get_conversation(&id), api.list_messages(&id, page));
            let _ = completions.send(Completion::Loaded { ticket, result });
        });
    }

    fn spawn_send(&self, request: SendMessageRequest, reply: oneshot::Sender<Result<SendOutcome>>) {
        let api = self.api.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.send_message(&request).await;
            let _ = completions.send(Completion::Sent { result, reply });
        });
    }

    /// Send over REST a message the realtime channel could not deliver
    fn redeliver(&self, request: SendMessageRequest) {
        info!("Resending message for {} over REST", request.conversation_id);
        let api = self.api.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.send_message(&request).await;
            let _ = completions.send(Completion::Redelivered { request, result });
        });
    }

    fn spawn_list(&self, reply: oneshot::Sender<Result<Vec<Conversation>>>) {
        let api = self.api.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.list_conversations().await;
            let _ = completions.send(Completion::ConversationsLoaded { result, reply });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Loaded { ticket, result } => self.finish_load(ticket, result),
            Completion::Sent { result, reply } => {
                let outcome = result.map(|message| {
                    self.ingest(message.clone(), Origin::Rest);
                    SendOutcome::Delivered(message)
                });
                if let Err(e) = &outcome {
                    warn!("Failed to send message: {}", e);
                    self.check_credential(e);
                }
                let _ = reply.send(outcome);
            }
            Completion::Redelivered { request, result } => match result {
                Ok(message) => self.ingest(message, Origin::Rest),
                Err(e) => {
                    warn!("Failed to resend message for {}: {}", request.conversation_id, e);
                    self.check_credential(&e);
                    let notification = self.notifications.add(NotificationDraft {
                        title: "Message not sent".to_string(),
                        message: summarize(&request.content, self.config.summary_max_chars),
                        kind: NotificationKind::Error,
                        conversation_id: Some(request.conversation_id),
                    });
                    self.bus.publish(ChatEvent::Notification(notification));
                }
            },
            Completion::ConversationsLoaded { result, reply } => {
                if let Err(e) = &result {
                    self.check_credential(e);
                }
                let result = result.map(|conversations| {
                    self.directory.replace(conversations);
                    self.bus.publish(ChatEvent::ConversationsChanged);
                    self.directory.list().to_vec()
                });
                let _ = reply.send(result);
            }
            Completion::Created { result, reply } => {
                match &result {
                    Ok(conversation) => {
                        info!("Created conversation {}", conversation.id);
                        self.directory.insert(conversation.clone());
                        self.bus.publish(ChatEvent::ConversationsChanged);
                    }
                    Err(e) => self.check_credential(e),
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Surface a REST failure caused by the credential itself
    fn check_credential(&self, error: &ChatError) {
        if error.is_unauthorized() {
            warn!("Credential rejected by the REST API: {}", error);
            self.bus.publish(ChatEvent::CredentialRejected {
                reason: error.reason(),
            });
        }
    }

    fn finish_load(&mut self, ticket: LoadTicket, result: Result<(Conversation, Vec<Message>)>) {
        if let Err(e) = &result {
            self.check_credential(e);
        }
        match self.sync.apply_load(&ticket, result) {
            LoadOutcome::Ready { added } => {
                debug!("{} new messages from history", added);
                self.read_state.on_history_loaded(&ticket.conversation_id);
                self.directory.reset_unread(&ticket.conversation_id);

                let known = self.directory.get(&ticket.conversation_id).is_some();
                if let Some(conversation) = self.sync.view().and_then(|v| v.conversation()) {
                    if !known {
                        self.directory.insert(conversation.clone());
                    }
                }
                self.publish_view();
                self.bus.publish(ChatEvent::ConversationsChanged);
            }
            LoadOutcome::Failed(_) => self.publish_view(),
            LoadOutcome::Stale => {}
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        let ChannelEvent { generation, event } = event;
        match event {
            TransportEvent::Frame(frame) => {
                if !self.connection.is_current(generation) {
                    debug!("Dropping frame from stale channel {}", generation);
                    return;
                }
                match frame {
                    ServerFrame::NewMessage(message) => self.ingest(message, Origin::Realtime),
                    ServerFrame::UserTyping(update) => self.remote_typing(update),
                }
            }
            // Resent whatever channel it came from; the user already saw it go out
            TransportEvent::Undelivered(request) => self.redeliver(request),
            event => {
                let failure = match &event {
                    TransportEvent::ConnectFailed {
                        reason,
                        unauthorized,
                    } if self.connection.is_current(generation) => {
                        Some(ChatEvent::ConnectionFailed {
                            reason: reason.clone(),
                            unauthorized: *unauthorized,
                        })
                    }
                    _ => None,
                };
                let event = ChannelEvent { generation, event };
                if let Some(transition) = self.connection.handle_event(&event) {
                    self.on_transition(transition);
                }
                if let Some(failure) = failure {
                    self.bus.publish(failure);
                }
            }
        }
    }

    fn on_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Up => {
                self.bus
                    .publish(ChatEvent::ConnectionChanged { connected: true });
                if let Some(active) = self.sync.active_id().map(str::to_string) {
                    self.rooms.join(&active, &self.connection);
                }
            }
            Transition::Down => {
                self.rooms.reset();
                self.bus
                    .publish(ChatEvent::ConnectionChanged { connected: false });
            }
        }
    }

    /// A message reaching the client by either path
    fn ingest(&mut self, message: Message, origin: Origin) {
        if self.sync.first_sighting(&message) {
            self.first_sighting(&message);
        }

        let incoming = match origin {
            Origin::Realtime => self.sync.apply_incoming(message.clone()),
            Origin::Rest => self.sync.apply_sent(message.clone()),
        };
        if incoming != Incoming::Appended {
            return;
        }

        if origin == Origin::Realtime
            && self.read_state.on_incoming(&message, self.sync.active_id())
        {
            self.directory.reset_unread(&message.conversation_id);
        }
        self.bus.publish(ChatEvent::MessageAppended {
            conversation_id: message.conversation_id.clone(),
            message,
        });
    }

    fn first_sighting(&mut self, message: &Message) {
        self.bus
            .publish(ChatEvent::IncomingMessage(message.clone()));

        if let Some(notification) = self.notifications.on_incoming(message) {
            self.bus.publish(ChatEvent::Notification(notification));
        }

        let touched = self
            .directory
            .touch(&message.conversation_id, message.created_at);
        let counted = self
            .directory
            .record_unread(message, self.sync.active_id());
        if touched || counted {
            self.bus.publish(ChatEvent::ConversationsChanged);
        }
    }

    fn remote_typing(&mut self, update: TypingUpdate) {
        let Some(active) = self.sync.active_id().map(str::to_string) else {
            return;
        };
        let conversation_id = update.conversation_id.unwrap_or_else(|| active.clone());
        if conversation_id != active {
            debug!("Ignoring typing update for inactive {}", conversation_id);
            return;
        }

        if self
            .remote
            .apply(&conversation_id, &update.user_id, update.is_typing, Instant::now())
        {
            self.publish_typers(&conversation_id);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.typing.next_deadline(), self.remote.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();
        if let Some(stop) = self.typing.poll(now) {
            debug!("Typing idle in {}", stop.conversation_id);
            self.emit_typing(stop);
        }
        for conversation_id in self.remote.expire(now) {
            self.publish_typers(&conversation_id);
        }
    }

    fn publish_view(&self) {
        let view = self.sync.view();
        self.bus.publish(ChatEvent::ViewChanged {
            conversation_id: view.map(|v| v.conversation_id().to_string()),
            status: view.map(|v| v.status().clone()),
        });
    }

    fn publish_typers(&self, conversation_id: &str) {
        self.bus.publish(ChatEvent::TypingChanged {
            conversation_id: conversation_id.to_string(),
            user_ids: self.remote.visible(conversation_id, &self.local_user.id),
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable front end of a [`ChatSession`]
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    bus: EventBus,
    connected: watch::Receiver<bool>,
}

impl ChatHandle {
    async fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::SessionClosed)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.post(command(reply)).await?;
        response.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Open the realtime channel with `credential`; `None` only tears down
    pub async fn connect(&self, credential: Option<Credential>) -> Result<()> {
        self.post(Command::Connect(credential)).await
    }

    /// Close the realtime channel, e.g. on logout
    pub async fn disconnect(&self) -> Result<()> {
        self.post(Command::Disconnect).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.post(Command::Shutdown).await
    }

    pub async fn open(&self, conversation_id: impl Into<String>) -> Result<()> {
        self.post(Command::Open(conversation_id.into())).await
    }

    pub async fn close(&self) -> Result<()> {
        self.post(Command::Close).await
    }

    /// Reload the open conversation's history
    pub async fn refresh(&self) -> Result<()> {
        self.post(Command::Refresh).await
    }

    pub async fn send(&self, content: impl Into<String>) -> Result<SendOutcome> {
        let content = content.into();
        self.request(|reply| Command::Send { content, reply })
            .await?
    }

    /// Local content changed
    pub async fn typing(&self) -> Result<()> {
        self.post(Command::Typing).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.request(Command::Conversations).await
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>> {
        self.request(Command::RefreshConversations).await?
    }

    /// Conversation with `laboratory_id`, created unless one already exists
    pub async fn create_conversation(
        &self,
        laboratory_id: impl Into<String>,
        order_id: Option<String>,
    ) -> Result<Conversation> {
        let laboratory_id = laboratory_id.into();
        self.request(|reply| Command::CreateConversation {
            laboratory_id,
            order_id,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<ViewSnapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn notifications(&self) -> Result<Vec<Notification>> {
        self.request(Command::Notifications).await
    }

    pub async fn mark_notification_read(&self, id: Uuid) -> Result<()> {
        self.post(Command::MarkNotificationRead(id)).await
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        self.post(Command::MarkAllNotificationsRead).await
    }

    pub async fn clear_notifications(&self) -> Result<()> {
        self.post(Command::ClearNotifications).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Whether the session has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
