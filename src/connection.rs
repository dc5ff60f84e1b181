//! Connection manager for the chat socket.
//!
//! A single task owns the socket, the heartbeat timer and the reconnect
//! timer. Everything else talks to it through a [`ConnectionHandle`], so all
//! connection state is mutated sequentially by one owner.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::ChatError;
use crate::events::{ClientFrame, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Shortest period handed to a tokio interval, which rejects zero
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Lifecycle of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn display_name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Timing and endpoint for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    /// Period of the liveness probe; also bounds a single connect attempt
    pub heartbeat_interval: Duration,
    /// Delay before reconnecting after an abnormal close
    pub reconnect_delay: Duration,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            url: config.ws_url(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

enum Command {
    Connect,
    Send {
        frame: ClientFrame,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Close,
}

/// Reports from per-connection tasks, tagged with the generation that produced them
enum SocketEvent {
    Opened { generation: u64, sink: WsSink },
    Frame { generation: u64, text: String },
    Closed { generation: u64, reason: String },
}

/// Cheap, cloneable front door to the connection task
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Ask for a (re)connect. Coalesces with an attempt already in flight.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Write one frame. Fails with `NotConnected` unless the channel is open.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ChatError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send { frame, reply })
            .map_err(|_| ChatError::NotConnected)?;
        response.await.unwrap_or(Err(ChatError::NotConnected))
    }

    /// Tear the connection down for good.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Poll every `poll` until connected, giving up after `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration, poll: Duration) -> Result<(), ChatError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(poll.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.is_connected() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ChatError::ConnectionTimeout(timeout));
            }
        }
    }
}

/// Owns exactly one "current" socket at a time.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    generation: u64,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
    state: watch::Sender<ConnectionState>,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    inbound: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionManager {
    /// Start the connection task and open the first connection.
    ///
    /// Returns the handle plus the receiver of decoded inbound events, which
    /// arrive one at a time in socket order.
    pub fn spawn(settings: ConnectionSettings) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let manager = ConnectionManager::new(settings, state_tx, inbound_tx);
        tokio::spawn(manager.run(command_rx));

        let handle = ConnectionHandle {
            commands,
            state: state_rx,
        };
        handle.connect();
        (handle, inbound_rx)
    }

    fn new(
        settings: ConnectionSettings,
        state: watch::Sender<ConnectionState>,
        inbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            generation: 0,
            sink: None,
            reader: None,
            heartbeat: None,
            reconnect_at: None,
            state,
            socket_tx,
            socket_rx,
            inbound,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect) => self.request_connect(),
                    Some(Command::Send { frame, reply }) => {
                        let result = self.send(&frame).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Close) | None => break,
                },
                Some(event) = self.socket_rx.recv() => self.handle_socket_event(event),
                _ = next_tick(&mut self.heartbeat) => self.probe().await,
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.request_connect();
                }
            }
        }

        self.shutdown();
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(state = next.display_name(), "connection state changed");
        }
    }

    /// Reconnect unless an attempt is already in flight.
    fn request_connect(&mut self) {
        if self.current_state() == ConnectionState::Connecting {
            debug!("connect already in flight; coalescing request");
            return;
        }
        self.connect();
    }

    /// Close whatever is current and open a fresh connection.
    fn connect(&mut self) {
        self.drop_current();
        self.heartbeat = None;
        self.reconnect_at = None;
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);

        let generation = self.generation;
        let url = self.settings.url.clone();
        let attempt_timeout = self.settings.heartbeat_interval.max(MIN_PERIOD);
        let events = self.socket_tx.clone();

        info!(%url, generation, "connecting");
        self.reader = Some(tokio::spawn(async move {
            match tokio::time::timeout(attempt_timeout, connect_async(url.as_str())).await {
                Ok(Ok((socket, _))) => {
                    let (sink, stream) = socket.split();
                    if events.send(SocketEvent::Opened { generation, sink }).is_err() {
                        return;
                    }
                    read_frames(generation, stream, events).await;
                }
                Ok(Err(err)) => {
                    let _ = events.send(SocketEvent::Closed {
                        generation,
                        reason: err.to_string(),
                    });
                }
                Err(_) => {
                    let _ = events.send(SocketEvent::Closed {
                        generation,
                        reason: "connect attempt timed out".to_string(),
                    });
                }
            }
        }));
    }

    /// Stop listening to the current connection and close it in the background.
    fn drop_current(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(sink) = self.sink.take() {
            close_sink(sink);
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Opened { generation, sink } => {
                if generation != self.generation {
                    debug!(generation, "superseded connection opened; closing it");
                    close_sink(sink);
                    return;
                }
                info!(generation, "connected");
                self.sink = Some(sink);
                self.reconnect_at = None;
                self.heartbeat = Some(self.new_heartbeat());
                self.set_state(ConnectionState::Connected);
            }
            SocketEvent::Frame { generation, text } => {
                if generation != self.generation {
                    trace!(generation, "ignoring frame from superseded connection");
                    return;
                }
                match ServerEvent::parse(&text) {
                    Ok(Some(event)) => {
                        trace!(kind = event.kind(), message_id = ?event.message_id(), "inbound event");
                        let _ = self.inbound.send(event);
                    }
                    Ok(None) => trace!("keepalive reply"),
                    Err(err) => warn!(error = %err, "dropping inbound frame"),
                }
            }
            SocketEvent::Closed { generation, reason } => {
                if generation != self.generation {
                    trace!(generation, "ignoring close from superseded connection");
                    return;
                }
                warn!(generation, %reason, "connection closed; scheduling reconnect");
                self.sink = None;
                self.reader = None;
                self.heartbeat = None;
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    /// Arm the reconnect timer; an already armed timer keeps its deadline.
    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_none() {
            self.reconnect_at = Some(Instant::now() + self.settings.reconnect_delay);
        }
    }

    fn new_heartbeat(&self) -> Interval {
        let period = self.settings.heartbeat_interval.max(MIN_PERIOD);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat
    }

    async fn probe(&mut self) {
        if self.current_state() != ConnectionState::Connected {
            info!("connection lost; reconnecting");
            self.request_connect();
            return;
        }

        match self.write(&ClientFrame::Ping).await {
            Ok(()) => debug!("heartbeat sent"),
            Err(err) => {
                warn!(error = %err, "heartbeat failed; reconnecting");
                self.set_state(ConnectionState::Disconnected);
                self.connect();
            }
        }
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<(), ChatError> {
        if self.current_state() != ConnectionState::Connected {
            return Err(ChatError::NotConnected);
        }

        if let Err(err) = self.write(frame).await {
            warn!(error = %err, "send failed; reconnecting");
            self.set_state(ConnectionState::Disconnected);
            self.connect();
            return Err(ChatError::NotConnected);
        }
        Ok(())
    }

    async fn write(&mut self, frame: &ClientFrame) -> Result<(), ChatError> {
        let payload = frame.to_json()?;
        let sink = self.sink.as_mut().ok_or(ChatError::NotConnected)?;
        sink.send(WsMessage::Text(payload)).await?;
        Ok(())
    }

    fn shutdown(&mut self) {
        info!("closing connection");
        self.drop_current();
        self.heartbeat = None;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn read_frames(
    generation: u64,
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let reason = loop {
        let text = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(WsMessage::Close(frame))) => {
                break frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by peer".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => break err.to_string(),
            None => break "stream ended".to_string(),
        };

        if events.send(SocketEvent::Frame { generation, text }).is_err() {
            return;
        }
    };

    let _ = events.send(SocketEvent::Closed { generation, reason });
}

fn close_sink(mut sink: WsSink) {
    tokio::spawn(async move {
        let _ = sink.close().await;
    });
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
