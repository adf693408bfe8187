//! Transport Session
//!
//! Single responsibility: own one physical broker connection at a time and keep it
//! alive, independent of how many topics ride on it.
//!
//! # State Machine
//!
//! ```text
//!            open()
//!              │
//!              ▼
//!        ┌───────────┐  CONNECTED   ┌───────────┐
//!   ┌───►│ Connecting├─────────────►│ Connected │
//!   │    └─────┬─────┘              └─────┬─────┘
//!   │          │ error/timeout            │ error, remote close,
//!   │          ▼                          │ ERROR frame, missed heartbeat
//!   │    ┌──────────────┐                 │
//!   └────┤ Disconnected │◄────────────────┘
//! delay  └──────────────┘
//!
//!   close() from any state ──► Closed (terminal)
//! ```
//!
//! Retries are unbounded with a fixed delay. Every successful handshake gets a
//! new connection id; `Connected { reconnected: true }` is the transition on which
//! the driver re-issues every desired subscription.
//!
//! # Ownership
//!
//! One spawned driver task owns the stream, the subscription table and the event
//! sender. Everything else talks to it through a command channel, so there is no
//! shared mutable connection state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use super::protocol::{decode_all, Command, Frame, HeartBeat, Inbound, HEARTBEAT};
use super::transport::{extract_host, Connector, Duplex};
use crate::credentials::CredentialProvider;
use crate::error::NotifyError;
use crate::subscription::SubscriptionTable;
use crate::topic::Topic;

/// Period used for timers whose direction is disabled; the branch is never polled.
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Bound on the best-effort DISCONNECT exchange during close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Configuration for a transport session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker WebSocket endpoint
    pub endpoint: String,
    /// How often we offer to send heartbeats (0 disables)
    pub heartbeat_outgoing: Duration,
    /// How often we want to receive heartbeats (0 disables)
    pub heartbeat_incoming: Duration,
    /// Silence longer than `incoming * tolerance` is a failure
    pub heartbeat_tolerance: u32,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Maximum wait for the CONNECTED frame
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/ws/notifications/websocket".to_string(),
            heartbeat_outgoing: Duration::from_secs(4),
            heartbeat_incoming: Duration::from_secs(4),
            heartbeat_tolerance: 2,
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected {
        connection_id: u64,
        reconnected: bool,
    },
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// A MESSAGE frame routed to the topic it was subscribed under.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub topic: Topic,
    pub message_id: Option<String>,
    pub body: String,
}

/// Everything the session reports, in the order it happened.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    State(ConnectionState),
    Frame(InboundFrame),
}

/// Receiving end of a session's event stream.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Requests from handles to the driver task.
pub(crate) enum SessionCommand {
    Register {
        owner: u64,
        subscriptions: Vec<(String, Topic)>,
    },
    Release {
        owner: u64,
    },
}

/// Handle to a running session driver.
///
/// Dropping the handle closes the session.
pub struct TransportSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Sender<bool>,
    ids: AtomicU64,
}

impl TransportSession {
    /// Start a session. Must be called from within a tokio runtime.
    ///
    /// Returns immediately in `Connecting`; progress is reported on the returned
    /// event stream and on [`TransportSession::state`].
    pub fn open(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> (Self, SessionEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(endpoint = %config.endpoint, "Opening notification session");

        let driver = Driver {
            config,
            connector,
            credentials,
            commands: command_rx,
            events: event_tx,
            state: Arc::clone(&state_tx),
            shutdown: shutdown_rx,
            table: SubscriptionTable::new(),
            connection_id: 0,
            failures: 0,
        };
        tokio::spawn(driver.run());

        let session = Self {
            commands: command_tx,
            state: state_tx,
            shutdown: shutdown_tx,
            ids: AtomicU64::new(0),
        };
        (session, event_rx)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop retrying and release the stream. Idempotent.
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.state.send_replace(ConnectionState::Closed);
        debug!("Notification session closed");
    }

    pub(crate) fn commands(&self) -> mpsc::UnboundedSender<SessionCommand> {
        self.commands.clone()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// How one connection ended.
enum Outcome {
    Closed,
    Dropped(NotifyError),
}

/// Driver task state. Lives for the whole session.
struct Driver {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Receiver<bool>,
    table: SubscriptionTable,
    connection_id: u64,
    failures: u64,
}

impl Driver {
    async fn run(mut self) {
        let mut reconnected = false;

        loop {
            if self.is_shutdown() {
                break;
            }

            self.set_state(ConnectionState::Connecting);

            match self.connect_and_serve(reconnected).await {
                Outcome::Closed => break,
                Outcome::Dropped(e) => {
                    self.failures += 1;
                    warn!(
                        error = %e,
                        failures = self.failures,
                        endpoint = %self.config.endpoint,
                        "Notification connection lost"
                    );
                }
            }

            self.table.deactivate();
            self.set_state(ConnectionState::Disconnected);
            reconnected = true;

            info!(delay = ?self.config.reconnect_delay, "Reconnecting after delay");
            if !self.wait_reconnect_delay().await {
                break;
            }
        }

        self.set_state(ConnectionState::Closed);
        debug!("Session driver stopped");
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Publish a state change unless the session is already closed.
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            let _ = self.events.send(SessionEvent::State(next));
        }
    }

    /// Sleep the reconnect delay while still accepting commands.
    ///
    /// Returns false if the session was closed meanwhile.
    async fn wait_reconnect_delay(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return !self.is_shutdown(),
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.is_shutdown() {
                        return false;
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    // Not connected, so no frames come back
                    Some(cmd) => {
                        self.apply_command(cmd, None);
                    }
                    None => return false,
                },
            }
        }
    }

    /// Connect, authenticate, subscribe, then serve until the connection ends.
    async fn connect_and_serve(&mut self, reconnected: bool) -> Outcome {
        let endpoint = self.config.endpoint.clone();

        let connected = tokio::select! {
            result = self.connector.connect(&endpoint) => result,
            _ = self.shutdown.changed() => return Outcome::Closed,
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => return Outcome::Dropped(e),
        };

        // Token is read per attempt and travels only in the CONNECT frame
        let token = self.credentials.bearer_token();
        if token.is_none() {
            warn!("No bearer token available; connecting unauthenticated");
        }
        let offered = HeartBeat::new(
            self.config.heartbeat_outgoing,
            self.config.heartbeat_incoming,
        );
        let connect = Frame::connect(extract_host(&endpoint), token.as_deref(), offered);
        if let Err(e) = stream.send(connect.encode()).await {
            return Outcome::Dropped(e);
        }

        let server_frame = match self.await_connected(stream.as_mut()).await {
            Ok(frame) => frame,
            Err(outcome) => {
                stream.close().await;
                return outcome;
            }
        };

        let server_beat = match server_frame.get("heart-beat").map(HeartBeat::parse) {
            Some(Ok(beat)) => beat,
            Some(Err(e)) => {
                warn!(error = %e, "Ignoring malformed heart-beat header");
                HeartBeat::default()
            }
            None => HeartBeat::default(),
        };
        let (send_every, expect_every) = offered.negotiate(server_beat);

        self.connection_id += 1;
        let connection_id = self.connection_id;
        info!(
            connection_id = connection_id,
            reconnected = reconnected,
            version = server_frame.get("version").unwrap_or("1.0"),
            send_every = ?send_every,
            expect_every = ?expect_every,
            "Notification session connected"
        );
        self.set_state(ConnectionState::Connected {
            connection_id,
            reconnected,
        });

        // Subscriptions do not survive a physical reconnect
        if reconnected && !self.table.is_empty() {
            info!(count = self.table.len(), "Re-subscribing after reconnect");
        }
        for frame in self.table.activate(connection_id) {
            if let Err(e) = stream.send(frame.encode()).await {
                return Outcome::Dropped(e);
            }
        }

        let outcome = self
            .serve(stream.as_mut(), connection_id, send_every, expect_every)
            .await;
        match outcome {
            Outcome::Closed => disconnect(stream.as_mut(), connection_id).await,
            Outcome::Dropped(_) => {
                if tokio::time::timeout(CLOSE_GRACE, stream.close()).await.is_err() {
                    debug!(connection_id = connection_id, "Close of dropped connection timed out");
                }
            }
        }
        outcome
    }

    /// Wait for CONNECTED, bounded by the connect timeout.
    async fn await_connected(&mut self, stream: &mut dyn Duplex) -> Result<Frame, Outcome> {
        let deadline = Instant::now() + self.config.connect_timeout;

        loop {
            let received = tokio::select! {
                r = timeout_at(deadline, stream.recv()) => r,
                _ = self.shutdown.changed() => return Err(Outcome::Closed),
            };

            let text = match received {
                Err(_) => {
                    return Err(Outcome::Dropped(NotifyError::Timeout(format!(
                        "No CONNECTED frame within {:?}",
                        self.config.connect_timeout
                    ))))
                }
                Ok(Err(e)) => return Err(Outcome::Dropped(e)),
                Ok(Ok(None)) => {
                    return Err(Outcome::Dropped(NotifyError::Handshake(
                        "Connection closed during handshake".into(),
                    )))
                }
                Ok(Ok(Some(text))) => text,
            };

            let inbound = decode_all(&text).map_err(Outcome::Dropped)?;
            for item in inbound {
                match item {
                    Inbound::Frame(frame) if frame.command == Command::Connected => {
                        return Ok(frame)
                    }
                    Inbound::Frame(frame) if frame.command == Command::Error => {
                        let reason = frame.get("message").unwrap_or(&frame.body).to_string();
                        return Err(Outcome::Dropped(NotifyError::Handshake(reason)));
                    }
                    Inbound::Frame(frame) => {
                        debug!(command = %frame.command, "Ignoring frame before CONNECTED")
                    }
                    Inbound::Heartbeat => {}
                }
            }
        }
    }

    /// Serve a live connection: commands out, frames in, heartbeats both ways.
    async fn serve(
        &mut self,
        stream: &mut dyn Duplex,
        connection_id: u64,
        send_every: Option<Duration>,
        expect_every: Option<Duration>,
    ) -> Outcome {
        let send_period = send_every.unwrap_or(IDLE_PERIOD);
        let mut send_tick = interval_at(Instant::now() + send_period, send_period);
        let check_period = expect_every.unwrap_or(IDLE_PERIOD);
        let mut check_tick = interval_at(Instant::now() + check_period, check_period);
        let silence_limit = expect_every.map(|d| d * self.config.heartbeat_tolerance);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.is_shutdown() {
                        // Releases queued before close still go out
                        while let Ok(cmd) = self.commands.try_recv() {
                            for frame in self.apply_command(cmd, Some(connection_id)) {
                                if stream.send(frame.encode()).await.is_err() {
                                    return Outcome::Closed;
                                }
                            }
                        }
                        return Outcome::Closed;
                    }
                }

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        for frame in self.apply_command(cmd, Some(connection_id)) {
                            if let Err(e) = stream.send(frame.encode()).await {
                                return Outcome::Dropped(e);
                            }
                        }
                    }
                    None => return Outcome::Closed,
                },

                received = stream.recv() => match received {
                    Ok(Some(text)) => {
                        last_inbound = Instant::now();
                        if let Err(e) = self.handle_inbound(&text, connection_id) {
                            return Outcome::Dropped(e);
                        }
                    }
                    Ok(None) => {
                        return Outcome::Dropped(NotifyError::Connection(
                            "Remote closed connection".into(),
                        ))
                    }
                    Err(e) => return Outcome::Dropped(e),
                },

                _ = send_tick.tick(), if send_every.is_some() => {
                    if let Err(e) = stream.send(HEARTBEAT.to_string()).await {
                        return Outcome::Dropped(e);
                    }
                    trace!(connection_id = connection_id, "Heartbeat sent");
                }

                _ = check_tick.tick(), if silence_limit.is_some() => {
                    let silent_for = last_inbound.elapsed();
                    if silence_limit.is_some_and(|limit| silent_for > limit) {
                        return Outcome::Dropped(NotifyError::Timeout(format!(
                            "No heartbeat from broker for {:?}",
                            silent_for
                        )));
                    }
                }
            }
        }
    }

    fn apply_command(&mut self, cmd: SessionCommand, connection: Option<u64>) -> Vec<Frame> {
        match cmd {
            SessionCommand::Register {
                owner,
                subscriptions,
            } => self.table.register(owner, subscriptions, connection),
            SessionCommand::Release { owner } => self.table.release(owner, connection),
        }
    }

    /// Route inbound frames. Undecodable input is dropped; an ERROR frame ends
    /// the connection.
    fn handle_inbound(&mut self, text: &str, connection_id: u64) -> Result<(), NotifyError> {
        let inbound = match decode_all(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable message");
                return Ok(());
            }
        };

        for item in inbound {
            let frame = match item {
                Inbound::Heartbeat => {
                    trace!(connection_id = connection_id, "Heartbeat received");
                    continue;
                }
                Inbound::Frame(frame) => frame,
            };

            match frame.command {
                Command::Message => match self.table.route(&frame, connection_id) {
                    Some(topic) => {
                        let event = SessionEvent::Frame(InboundFrame {
                            topic: topic.clone(),
                            message_id: frame.get("message-id").map(str::to_string),
                            body: frame.body,
                        });
                        let _ = self.events.send(event);
                    }
                    None => debug!(
                        subscription = ?frame.get("subscription"),
                        destination = ?frame.get("destination"),
                        "Dropping frame for unknown subscription"
                    ),
                },
                Command::Error => {
                    let reason = frame.get("message").unwrap_or(&frame.body).to_string();
                    return Err(NotifyError::Protocol(format!("Broker error: {}", reason)));
                }
                Command::Receipt => {
                    debug!(receipt = ?frame.get("receipt-id"), "Receipt received")
                }
                other => debug!(command = %other, "Ignoring unexpected frame"),
            }
        }
        Ok(())
    }
}

/// Best-effort DISCONNECT and close.
async fn disconnect(stream: &mut dyn Duplex, connection_id: u64) {
    let frame = Frame::disconnect(&format!("close-{}", connection_id));
    let exchange = async {
        if let Err(e) = stream.send(frame.encode()).await {
            debug!(error = %e, "DISCONNECT not delivered");
        }
        stream.close().await;
    };
    if tokio::time::timeout(CLOSE_GRACE, exchange).await.is_err() {
        debug!("Close exchange timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_outgoing, Duration::from_secs(4));
        assert_eq!(config.heartbeat_incoming, Duration::from_secs(4));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.heartbeat_tolerance, 2);
    }

    #[test]
    fn test_connection_state_is_connected() {
        assert!(ConnectionState::Connected {
            connection_id: 1,
            reconnected: false
        }
        .is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Closed.is_connected());
    }
}
