//! Shared fakes for the session tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use oralsuite_chat::{
    ChatApi, ChatConfig, ChatError, ChatEvent, ChatHandle, ChatSession, ChannelEvent,
    ChannelHandle, ClientFrame, Connector, Conversation, CreateConversationRequest, Credential,
    LocalUser, LogAlertSink, Message, Page, Result, Role, SendMessageRequest, ServerFrame,
    Subscription, TransportEvent,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const LOCAL_USER: &str = "dentist-1";
pub const LAB: &str = "lab-1";

pub fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, second).unwrap()
}

pub fn message(id: &str, conversation_id: &str, sender_id: &str, second: u32) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: format!("content of {}", id),
        is_read: false,
        read_at: None,
        created_at: at(second),
        sender: None,
    }
}

pub fn conversation(id: &str, laboratory_id: &str, order_id: Option<&str>) -> Conversation {
    Conversation {
        id: id.to_string(),
        order_id: order_id.map(str::to_string),
        dentist_id: LOCAL_USER.to_string(),
        laboratory_id: laboratory_id.to_string(),
        is_active: true,
        last_message_at: None,
        created_at: at(0),
    }
}

/// In-memory backend with call counters
#[derive(Default)]
pub struct FakeApi {
    pub conversations: Mutex<Vec<Conversation>>,
    /// Stored newest first, as the server returns them
    pub history: Mutex<HashMap<String, Vec<Message>>>,
    pub failing_history: Mutex<HashMap<String, String>>,
    pub gates: Mutex<HashMap<String, Arc<Notify>>>,
    pub fail_send: Mutex<Option<String>>,
    pub sent: Mutex<Vec<SendMessageRequest>>,
    pub created: Mutex<Vec<CreateConversationRequest>>,
    pub marked_read: Mutex<Vec<String>>,
    /// Refuse every conversation listing with 401
    pub reject_credential: AtomicBool,
    pub history_calls: AtomicU64,
    next_id: AtomicU64,
}

impl FakeApi {
    pub fn with_history(conversation_id: &str, newest_first: Vec<Message>) -> Self {
        let api = Self::default();
        api.add_history(conversation_id, newest_first);
        api
    }

    pub fn add_history(&self, conversation_id: &str, newest_first: Vec<Message>) {
        self.conversations
            .lock()
            .push(conversation(conversation_id, LAB, Some(conversation_id)));
        self.history
            .lock()
            .insert(conversation_id.to_string(), newest_first);
    }

    /// Hold history requests for `conversation_id` until released
    pub fn gate(&self, conversation_id: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .insert(conversation_id.to_string(), notify.clone());
        notify
    }

    pub fn marked_read(&self) -> Vec<String> {
        self.marked_read.lock().clone()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        if self.reject_credential.load(Ordering::SeqCst) {
            return Err(ChatError::Unauthorized("Token expired".into()));
        }
        Ok(self.conversations.lock().clone())
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        self.conversations
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))
    }

    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<Conversation> {
        self.created.lock().push(request.clone());
        let id = format!("conv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let created = conversation(&id, &request.laboratory_id, request.order_id.as_deref());
        self.conversations.lock().push(created.clone());
        Ok(created)
    }

    async fn list_messages(&self, conversation_id: &str, page: Page) -> Result<Vec<Message>> {
        assert_eq!(page, Page::first(50));
        self.history_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().get(conversation_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(reason) = self.failing_history.lock().get(conversation_id) {
            return Err(ChatError::Api {
                status: 500,
                message: reason.clone(),
            });
        }
        Ok(self
            .history
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message> {
        self.sent.lock().push(request.clone());
        if let Some(reason) = self.fail_send.lock().clone() {
            return Err(ChatError::Api {
                status: 400,
                message: reason,
            });
        }

        let id = format!("sent-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(Message {
            id,
            conversation_id: request.conversation_id.clone(),
            sender_id: LOCAL_USER.to_string(),
            content: request.content.clone(),
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
            sender: None,
        })
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.marked_read.lock().push(conversation_id.to_string());
        Ok(())
    }
}

struct FakeChannel {
    generation: u64,
    token: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
}

/// Connector whose channels are driven by the test
#[derive(Default)]
pub struct FakeConnector {
    channels: Mutex<Vec<FakeChannel>>,
}

impl Connector for FakeConnector {
    fn open(
        &self,
        generation: u64,
        credential: &Credential,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().push(FakeChannel {
            generation,
            token: credential.token().to_string(),
            events,
            outbound: rx,
        });
        ChannelHandle::new(generation, tx, None)
    }
}

impl FakeConnector {
    pub fn opened(&self) -> Vec<(u64, String)> {
        self.channels
            .lock()
            .iter()
            .map(|c| (c.generation, c.token.clone()))
            .collect()
    }

    pub fn latest_generation(&self) -> u64 {
        self.channels.lock().last().map(|c| c.generation).unwrap_or(0)
    }

    pub fn report(&self, generation: u64, event: TransportEvent) {
        let channels = self.channels.lock();
        let channel = channels
            .iter()
            .find(|c| c.generation == generation)
            .expect("Failed to find channel");
        channel
            .events
            .send(ChannelEvent { generation, event })
            .expect("Failed to report channel event");
    }

    pub fn connect_latest(&self) {
        self.report(self.latest_generation(), TransportEvent::Connected);
    }

    pub fn push(&self, frame: ServerFrame) {
        self.report(self.latest_generation(), TransportEvent::Frame(frame));
    }

    /// Every frame emitted so far, oldest channel first
    pub fn frames(&self) -> Vec<ClientFrame> {
        let mut channels = self.channels.lock();
        let mut frames = Vec::new();
        for channel in channels.iter_mut() {
            while let Ok(frame) = channel.outbound.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }
}

pub struct Harness {
    pub chat: ChatHandle,
    pub api: Arc<FakeApi>,
    pub connector: Arc<FakeConnector>,
    pub events: Subscription,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn start(api: FakeApi) -> Harness {
    init_tracing();
    let api = Arc::new(api);
    let connector = Arc::new(FakeConnector::default());
    let (session, chat) = ChatSession::new(
        ChatConfig::default(),
        LocalUser::new(LOCAL_USER, Role::Dentist),
        api.clone(),
        connector.clone(),
        Arc::new(LogAlertSink),
    );
    let events = chat.subscribe();
    tokio::spawn(session.run());

    Harness {
        chat,
        api,
        connector,
        events,
    }
}

impl Harness {
    /// Open the channel and wait until the session reports it connected
    pub async fn connect(&mut self, token: &str) {
        self.chat
            .connect(Some(Credential::new(token)))
            .await
            .expect("Failed to connect");
        // The connect command must be handled before the channel exists
        self.chat.snapshot().await.expect("Failed to get snapshot");
        self.connector.connect_latest();
        self.wait_for(|e| matches!(e, ChatEvent::ConnectionChanged { connected: true }))
            .await;
    }

    /// Open a conversation and wait for its history to settle
    pub async fn open(&mut self, conversation_id: &str) -> ChatEvent {
        self.chat
            .open(conversation_id)
            .await
            .expect("Failed to open conversation");
        let id = conversation_id.to_string();
        self.wait_for(move |e| match e {
            ChatEvent::ViewChanged {
                conversation_id: Some(open),
                status: Some(status),
            } => *open == id && *status != oralsuite_chat::ViewStatus::Loading,
            _ => false,
        })
        .await
    }

    pub async fn wait_for(&mut self, predicate: impl Fn(&ChatEvent) -> bool) -> ChatEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                let event = events.recv().await.expect("Failed to receive event");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("Timed out waiting for event")
    }

    pub fn message_ids(snapshot: &oralsuite_chat::ViewSnapshot) -> Vec<String> {
        snapshot.messages.iter().map(|m| m.id.clone()).collect()
    }
}

/// Poll `condition` until it holds
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached");
}
