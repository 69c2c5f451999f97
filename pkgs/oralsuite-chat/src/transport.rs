//! Realtime transport
//!
//! A [`Connector`] opens one bidirectional channel and returns immediately;
//! connecting, reading and writing happen in a background task that reports
//! back through [`ChannelEvent`]s. Every event is tagged with the generation
//! of the channel that produced it so the owner can drop events coming from
//! a channel it has already torn down.
//!
//! Reconnection lives here and not in the connection manager: the WebSocket
//! transport retries dropped or failed connections with exponential backoff,
//! except when the server rejects the credential at handshake.
//!
//! A `send_message` frame that cannot be written (the socket failed under
//! it, or it was queued while reconnecting) is handed back to the owner as
//! [`TransportEvent::Undelivered`]. Other frames are dropped; room
//! membership is re-established after every reconnect anyway.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::models::{Credential, SendMessageRequest};
use crate::protocol::{ClientFrame, ServerFrame};

/// What a channel reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    ConnectFailed { reason: String, unauthorized: bool },
    Frame(ServerFrame),
    /// A message that never reached the server
    Undelivered(SendMessageRequest),
}

/// A [`TransportEvent`] tagged with the channel generation
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Owner side of an open channel; dropping it stops the channel
pub struct ChannelHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(
        generation: u64,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            generation,
            outbound,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame; fire-and-forget from the caller's point of view
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| ChatError::Transport("channel closed".to_string()))
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens realtime channels
pub trait Connector: Send + Sync {
    fn open(
        &self,
        generation: u64,
        credential: &Credential,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle;
}

/// [`Connector`] over WebSocket with the credential in the upgrade request
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: Url,
    reconnect_delay: Duration,
    reconnect_delay_max: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        Ok(Self {
            endpoint: config.socket_endpoint()?,
            reconnect_delay: config.reconnect_delay,
            reconnect_delay_max: config.reconnect_delay_max,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Connector for WebSocketConnector {
    fn open(
        &self,
        generation: u64,
        credential: &Credential,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let worker = ChannelWorker {
            generation,
            endpoint: self.endpoint.clone(),
            credential: credential.clone(),
            reconnect_delay: self.reconnect_delay,
            reconnect_delay_max: self.reconnect_delay_max,
            outbound: outbound_rx,
            events,
        };
        let task = tokio::spawn(worker.run());
        ChannelHandle::new(generation, outbound_tx, Some(task))
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnectError {
    Rejected(String),
    Failed(String),
}

enum PumpExit {
    /// The owner dropped the handle
    Closed,
    /// The socket went away
    Dropped(String),
}

struct ChannelWorker {
    generation: u64,
    endpoint: Url,
    credential: Credential,
    reconnect_delay: Duration,
    reconnect_delay_max: Duration,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelWorker {
    async fn run(mut self) {
        let mut delay = self.reconnect_delay;

        loop {
            match self.connect().await {
                Ok(socket) => {
                    info!("Realtime channel {} connected", self.generation);
                    delay = self.reconnect_delay;
                    if !self.report(TransportEvent::Connected) {
                        return;
                    }
                    match self.pump(socket).await {
                        PumpExit::Closed => return,
                        PumpExit::Dropped(reason) => {
                            warn!("Realtime channel {} dropped: {}", self.generation, reason);
                            if !self.report(TransportEvent::Disconnected { reason }) {
                                return;
                            }
                        }
                    }
                }
                Err(ConnectError::Rejected(reason)) => {
                    error!("Realtime handshake rejected: {}", reason);
                    while let Ok(frame) = self.outbound.try_recv() {
                        self.give_back(frame);
                    }
                    self.report(TransportEvent::ConnectFailed {
                        reason,
                        unauthorized: true,
                    });
                    return;
                }
                Err(ConnectError::Failed(reason)) => {
                    error!("Realtime connection failed: {}", reason);
                    if !self.report(TransportEvent::ConnectFailed {
                        reason,
                        unauthorized: false,
                    }) {
                        return;
                    }
                }
            }

            if !self.backoff(delay).await {
                return;
            }
            delay = (delay * 2).min(self.reconnect_delay_max);
        }
    }

    fn report(&self, event: TransportEvent) -> bool {
        self.events
            .send(ChannelEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    async fn connect(&self) -> std::result::Result<Socket, ConnectError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Failed(e.to_string()))?;
        let auth = HeaderValue::from_str(&self.credential.bearer())
            .map_err(|e| ConnectError::Rejected(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        match connect_async(request).await {
            Ok((socket, _)) => Ok(socket),
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                match status {
                    401 | 403 => Err(ConnectError::Rejected(format!(
                        "server refused credential ({})",
                        status
                    ))),
                    code => Err(ConnectError::Failed(format!("HTTP error {}", code))),
                }
            }
            Err(e) => Err(ConnectError::Failed(e.to_string())),
        }
    }

    async fn pump(&mut self, socket: Socket) -> PumpExit {
        let (mut write, mut read) = socket.split();

        loop {
            tokio::select! {
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return PumpExit::Closed;
                    };
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {} frame: {}", frame.name(), e);
                            continue;
                        }
                    };
                    debug!("Emitting {}", frame.name());
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        self.give_back(frame);
                        return PumpExit::Dropped(e.to_string());
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => match ServerFrame::decode(&text) {
                            Ok(frame) => {
                                if !self.report(TransportEvent::Frame(frame)) {
                                    return PumpExit::Closed;
                                }
                            }
                            Err(e) => debug!("Skipping unrecognised frame: {}", e),
                        },
                        Some(Ok(WsMessage::Close(_))) => {
                            return PumpExit::Dropped("closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
                        None => return PumpExit::Dropped("stream ended".to_string()),
                    }
                }
            }
        }
    }

    /// Wait before the next attempt; frames queued meanwhile are handed back.
    /// Returns false once the owner is gone.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return !self.events.is_closed(),
                frame = self.outbound.recv() => match frame {
                    Some(frame) => self.give_back(frame),
                    None => return false,
                },
            }
        }
    }

    fn give_back(&self, frame: ClientFrame) {
        match frame {
            ClientFrame::SendMessage(request) => {
                warn!(
                    "Message for {} not delivered over realtime channel {}",
                    request.conversation_id, self.generation
                );
                self.report(TransportEvent::Undelivered(request));
            }
            other => debug!("Dropping {} while reconnecting", other.name()),
        }
    }
}
