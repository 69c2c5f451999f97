//! OralSuite Chat - realtime messaging engine for dentists and laboratories
//!
//! This crate keeps a client's view of dentist/laboratory conversations
//! consistent while messages arrive over two paths: a persistent WebSocket
//! channel and the REST API used for history and as a send fallback.
//!
//! # Architecture
//!
//! All state lives in one [`ChatSession`] task, driven through cloneable
//! [`ChatHandle`]s:
//!
//! - **ConnectionManager**: the single realtime channel and its `connected` flag
//! - **RoomMembership**: join/leave of the open conversation's room
//! - **MessageSynchronizer**: history + realtime merged into one ordered,
//!   duplicate-free log; realtime-preferred sends with REST fallback
//! - **TypingCoordinator / RemoteTypers**: typing start/stop debounce and the
//!   set of users typing in the open conversation
//! - **ReadStateTracker**: marks the open conversation read
//! - **NotificationDispatcher**: notifications for messages from others
//! - **ConversationDirectory**: the conversation list with unread counters
//!
//! Collaborators are injected: a [`ChatApi`] for REST, a [`Connector`] for
//! the realtime channel and an [`AlertSink`] for audible/visual alerts.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use oralsuite_chat::{
//!     ChatConfig, ChatSession, Credential, HttpChatApi, LocalUser, LogAlertSink, Role,
//!     WebSocketConnector,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChatConfig::from_env();
//! let credential = Credential::new("token");
//! let api = Arc::new(HttpChatApi::new(&config, credential.clone())?);
//! let connector = Arc::new(WebSocketConnector::new(&config)?);
//!
//! let (session, chat) = ChatSession::new(
//!     config,
//!     LocalUser::new("dentist-1", Role::Dentist),
//!     api,
//!     connector,
//!     Arc::new(LogAlertSink),
//! );
//! tokio::spawn(session.run());
//!
//! chat.connect(Some(credential)).await?;
//! chat.open("conversation-1").await?;
//! chat.send("The crown shade is A2").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod error;
pub mod models;
pub mod notifications;
pub mod protocol;
pub mod read_state;
pub mod room;
pub mod session;
pub mod sync;
pub mod transport;
pub mod typing;

pub use api::{ChatApi, HttpChatApi, Page};
pub use bus::{ChatEvent, EventBus, Subscription};
pub use config::ChatConfig;
pub use connection::{ConnectOutcome, ConnectionManager, Transition};
pub use conversations::ConversationDirectory;
pub use error::{ChatError, Result};
pub use models::{
    normalize_content, Conversation, ConversationKey, CreateConversationRequest, Credential,
    LocalUser, Message, MessageSender, Role, SendMessageRequest, TypingSignal, TypingUpdate,
};
pub use notifications::{
    summarize, AlertSink, LogAlertSink, Notification, NotificationDispatcher, NotificationDraft,
    NotificationKind,
};
pub use protocol::{ClientFrame, ServerFrame};
pub use read_state::ReadStateTracker;
pub use room::RoomMembership;
pub use session::{ChatHandle, ChatSession, SendOutcome, ViewSnapshot};
pub use sync::{MessageLog, MessageSynchronizer, ViewStatus};
pub use transport::{ChannelEvent, ChannelHandle, Connector, TransportEvent, WebSocketConnector};
pub use typing::{RemoteTypers, TypingCoordinator};
