//! Connection manager
//!
//! Owns at most one realtime channel per session and reflects its state as a
//! single `connected` flag. Every other component treats that flag as the
//! only gate for realtime operations and falls back to REST otherwise.
//!
//! Teardown is synchronous: the previous channel is released and
//! `connected` cleared before a new channel may be opened, so two live
//! channels never coexist. Events reported by a released channel are
//! recognised by their generation and ignored.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::models::Credential;
use crate::protocol::ClientFrame;
use crate::transport::{ChannelEvent, ChannelHandle, Connector, TransportEvent};

/// Connected-state change produced by a transport event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    channel: Option<ChannelHandle>,
    generation: u64,
    connected: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ConnectionManager {
    /// `events` is where every channel opened by this manager reports
    pub fn new(connector: Arc<dyn Connector>, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            connector,
            channel: None,
            generation: 0,
            connected,
            events,
        }
    }

    /// Open a channel authenticated with `credential`, replacing any existing one.
    ///
    /// Without a credential nothing is attempted. `was_connected` in the
    /// outcome lets the caller publish the drop of the previous channel.
    pub fn connect(&mut self, credential: Option<&Credential>) -> ConnectOutcome {
        let was_connected = self.disconnect();

        let Some(credential) = credential else {
            debug!("No credential available, realtime channel not opened");
            return ConnectOutcome {
                opened: false,
                was_connected,
            };
        };

        self.generation += 1;
        info!("Opening realtime channel {}", self.generation);
        let handle = self
            .connector
            .open(self.generation, credential, self.events.clone());
        self.channel = Some(handle);

        ConnectOutcome {
            opened: true,
            was_connected,
        }
    }

    /// Release the channel and clear `connected`. Returns whether it was connected.
    pub fn disconnect(&mut self) -> bool {
        let was_connected = *self.connected.borrow();
        if let Some(handle) = self.channel.take() {
            info!("Closing realtime channel {}", handle.generation());
            handle.close();
        }
        self.set_connected(false);
        was_connected
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Observe the connected flag
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Emit a frame over the live channel
    pub fn emit(&self, frame: ClientFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        match &self.channel {
            Some(handle) => handle.send(frame),
            None => Err(ChatError::NotConnected),
        }
    }

    /// Apply a connection-level transport event.
    ///
    /// Events from released channels are ignored. Frames and undelivered
    /// messages are not handled here; the caller routes them.
    pub fn handle_event(&mut self, event: &ChannelEvent) -> Option<Transition> {
        let current = self.channel.as_ref().map(ChannelHandle::generation);
        if current != Some(event.generation) {
            debug!(
                "Ignoring event from stale channel {} (current {:?})",
                event.generation, current
            );
            return None;
        }

        match &event.event {
            TransportEvent::Connected => {
                info!("Realtime channel connected");
                self.set_connected(true).then_some(Transition::Up)
            }
            TransportEvent::Disconnected { reason } => {
                warn!("Realtime channel disconnected: {}", reason);
                self.set_connected(false).then_some(Transition::Down)
            }
            TransportEvent::ConnectFailed {
                reason,
                unauthorized,
            } => {
                error!("Realtime connection error: {}", reason);
                if *unauthorized {
                    // The transport gave up; nothing left to observe
                    self.channel = None;
                }
                self.set_connected(false).then_some(Transition::Down)
            }
            TransportEvent::Frame(_) | TransportEvent::Undelivered(_) => None,
        }
    }

    /// Whether `generation` is the live channel
    pub fn is_current(&self, generation: u64) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|h| h.generation() == generation)
    }

    fn set_connected(&self, value: bool) -> bool {
        self.connected.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Result of [`ConnectionManager::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub opened: bool,
    pub was_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credential;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingConnector {
        opened: Mutex<Vec<u64>>,
        outbound: Mutex<Vec<mpsc::UnboundedReceiver<ClientFrame>>>,
    }

    impl Connector for RecordingConnector {
        fn open(
            &self,
            generation: u64,
            _credential: &Credential,
            _events: mpsc::UnboundedSender<ChannelEvent>,
        ) -> ChannelHandle {
            let (tx, rx) = mpsc::unbounded_channel();
            self.opened.lock().push(generation);
            self.outbound.lock().push(rx);
            ChannelHandle::new(generation, tx, None)
        }
    }

    fn manager() -> (ConnectionManager, Arc<RecordingConnector>) {
        let connector = Arc::new(RecordingConnector::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(connector.clone(), tx), connector)
    }

    fn event(generation: u64, event: TransportEvent) -> ChannelEvent {
        ChannelEvent { generation, event }
    }

    #[test]
    fn test_no_credential_no_attempt() {
        let (mut manager, connector) = manager();
        let outcome = manager.connect(None);
        assert!(!outcome.opened);
        assert!(connector.opened.lock().is_empty());
        assert!(!manager.has_channel());
    }

    #[test]
    fn test_reconnect_replaces_channel_and_ignores_stale_events() {
        let (mut manager, connector) = manager();
        let cred = Credential::new("t1");

        manager.connect(Some(&cred));
        assert_eq!(
            manager.handle_event(&event(1, TransportEvent::Connected)),
            Some(Transition::Up)
        );

        let outcome = manager.connect(Some(&Credential::new("t2")));
        assert!(outcome.was_connected);
        assert!(!manager.is_connected());
        assert_eq!(*connector.opened.lock(), vec![1, 2]);

        // Late events from the first channel change nothing
        assert_eq!(manager.handle_event(&event(1, TransportEvent::Connected)), None);
        assert!(!manager.is_connected());

        assert_eq!(
            manager.handle_event(&event(2, TransportEvent::Connected)),
            Some(Transition::Up)
        );
    }

    #[test]
    fn test_emit_requires_connection() {
        let (mut manager, connector) = manager();
        manager.connect(Some(&Credential::new("t")));

        let frame = ClientFrame::JoinConversation("c1".into());
        assert!(matches!(manager.emit(frame.clone()), Err(ChatError::NotConnected)));

        manager.handle_event(&event(1, TransportEvent::Connected));
        manager.emit(frame.clone()).unwrap();

        let mut outbound = connector.outbound.lock();
        assert_eq!(outbound[0].try_recv().unwrap(), frame);
    }

    #[test]
    fn test_connect_failure_sets_disconnected() {
        let (mut manager, _) = manager();
        manager.connect(Some(&Credential::new("t")));
        manager.handle_event(&event(1, TransportEvent::Connected));

        let transition = manager.handle_event(&event(
            1,
            TransportEvent::ConnectFailed {
                reason: "expired".into(),
                unauthorized: true,
            },
        ));
        assert_eq!(transition, Some(Transition::Down));
        assert!(!manager.is_connected());
        assert!(!manager.has_channel());
    }

    #[test]
    fn test_disconnect_is_synchronous() {
        let (mut manager, _) = manager();
        let watcher = manager.watch();
        manager.connect(Some(&Credential::new("t")));
        manager.handle_event(&event(1, TransportEvent::Connected));
        assert!(*watcher.borrow());

        assert!(manager.disconnect());
        assert!(!*watcher.borrow());
        assert!(!manager.has_channel());
    }
}
