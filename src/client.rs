//! Rover client implementation

use crate::config::RoverConfig;
use crate::error::{Result, RoverError};
use crate::protocol::{RobotMessage, TelemetryFrame, IDENT_TOKEN, MOTOR_COMMAND_PREFIX};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to the controller
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected; telemetry and commands flow
    Open,
    /// Shutting down the transport on request
    Closing,
}

/// Handler for decoded telemetry frames
pub type DataHandler = Arc<dyn Fn(TelemetryFrame) + Send + Sync>;

/// Handler for connectivity transitions
pub type ConnectionHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// A registered telemetry subscriber; drop-safe, unsubscribe explicitly
pub struct DataSubscription {
    client: Arc<ClientInner>,
    id: Uuid,
}

impl DataSubscription {
    /// Stop receiving telemetry frames on this handler
    pub fn unsubscribe(self) {
        self.client.data_handlers.lock().retain(|(id, _)| *id != self.id);
    }
}

/// A registered connectivity subscriber
pub struct ConnectionSubscription {
    client: Arc<ClientInner>,
    id: Uuid,
}

impl ConnectionSubscription {
    /// Stop receiving connectivity events on this handler
    pub fn unsubscribe(self) {
        self.client
            .connection_handlers
            .lock()
            .retain(|(id, _)| *id != self.id);
    }
}

/// Message to send to the connection task
enum OutboundMessage {
    Send(String),
    Shutdown,
}

const OUTBOUND_QUEUE: usize = 32;

/// Internal client state
struct ClientInner {
    config: RoverConfig,
    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,

    // Endpoint of the last connect attempt, so blind retries hit the same target
    target: Mutex<Option<(String, u16)>>,

    // Channel for handing messages to the live connection task
    tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,

    // Subscribers, delivered in registration order
    data_handlers: Mutex<Vec<(Uuid, DataHandler)>>,
    connection_handlers: Mutex<Vec<(Uuid, ConnectionHandler)>>,

    // Consecutive unexpected closes with no intervening successful open
    reconnect_attempts: AtomicU32,

    // Bumped on every connect/disconnect; stale transports and timers check it
    // before touching shared state
    generation: AtomicU64,

    // Cause of the most recent connect failure, picked up by connect()
    last_error: Mutex<Option<String>>,

    // Receipt time of the last telemetry frame (staleness diagnostics)
    last_frame_at: Mutex<Option<Instant>>,

    // Shutdown signal for the live connection task
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Client for the rover controller's WebSocket telemetry/control link
///
/// Owns a single persistent connection, performs the identification
/// handshake, decodes telemetry lines, fans frames and connectivity changes
/// out to subscribers, and retries a bounded number of times after an
/// unexpected drop. Cheaply cloneable via an internal Arc, so one instance
/// can be shared across the screens that need it.
#[derive(Clone)]
pub struct RoverClient {
    inner: Arc<ClientInner>,
}

impl RoverClient {
    /// Create a new client with the given configuration
    pub fn new(config: RoverConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(ClientInner {
            config,
            state: state_tx,
            state_rx,
            target: Mutex::new(None),
            tx: Mutex::new(None),
            data_handlers: Mutex::new(Vec::new()),
            connection_handlers: Mutex::new(Vec::new()),
            reconnect_attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_frame_at: Mutex::new(None),
            shutdown: Mutex::new(None),
        });

        Self { inner }
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Whether the connection is currently open
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Consecutive failed reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Connect to the configured controller address
    pub async fn connect(&self) -> Result<()> {
        {
            let mut target = self.inner.target.lock();
            if target.is_none() {
                *target = Some((self.inner.config.host.clone(), self.inner.config.port));
            }
        }
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.connect_current().await
    }

    /// Connect to the given controller address, superseding any prior transport
    pub async fn connect_to(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let host = host.into();
        if host.is_empty() {
            return Err(RoverError::Connection {
                target: format!(":{port}"),
                reason: "host must not be empty".to_string(),
            });
        }

        *self.inner.target.lock() = Some((host, port));
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.connect_current().await
    }

    async fn connect_current(&self) -> Result<()> {
        let target = self.inner.target_string();

        // Tear down any previous transport before wiring up the new one, so a
        // stale connection's late events cannot fire our callbacks twice.
        self.inner.teardown_transport();

        let generation = self.inner.next_generation();
        self.inner.set_state(ConnectionState::Connecting);

        let task_inner = self.inner.clone();
        tokio::spawn(async move {
            connection_task(task_inner, generation, false).await;
        });

        let mut state_rx = self.inner.state_rx.clone();
        let wait = async {
            loop {
                match *state_rx.borrow_and_update() {
                    ConnectionState::Open => return Ok(()),
                    ConnectionState::Disconnected => {
                        let reason = self
                            .inner
                            .last_error
                            .lock()
                            .take()
                            .unwrap_or_else(|| "connection failed".to_string());
                        return Err(RoverError::Connection {
                            target: target.clone(),
                            reason,
                        });
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(RoverError::Shutdown);
                }
            }
        };

        let outcome = timeout(self.inner.config.connect_timeout, wait).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // An open that raced the timeout still wins; a later open
                // leaves the connection usable even though we report failure.
                if self.is_connected() {
                    Ok(())
                } else {
                    Err(RoverError::Timeout {
                        target,
                        timeout: self.inner.config.connect_timeout,
                    })
                }
            }
        }
    }

    /// Close the connection and suppress any pending reconnect. Idempotent.
    pub fn disconnect(&self) {
        self.inner.teardown_transport();
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);

        if self.connection_state() != ConnectionState::Disconnected {
            self.inner.set_state(ConnectionState::Closing);
            self.inner.set_state(ConnectionState::Disconnected);
            info!("disconnected");
        }
    }

    /// Send a movement command (`forward`, `backward`, `left`, `right`,
    /// `stop`). Dropped with a warning if the connection is not open.
    pub fn send_motor_command(&self, command: &str) {
        let payload = format!("{MOTOR_COMMAND_PREFIX}{command}");
        match self.inner.send_text(payload) {
            Ok(()) => debug!(%command, "motor command sent"),
            Err(e) => warn!(%command, error = %e, "motor command dropped"),
        }
    }

    /// Register a telemetry subscriber; frames are delivered in registration
    /// order, and a panicking handler does not block the others
    pub fn on_data<F>(&self, handler: F) -> DataSubscription
    where
        F: Fn(TelemetryFrame) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.inner.data_handlers.lock().push((id, Arc::new(handler)));
        DataSubscription {
            client: self.inner.clone(),
            id,
        }
    }

    /// Register a connectivity subscriber (`true` on open, `false` on an
    /// unexpected close)
    pub fn on_connection<F>(&self, handler: F) -> ConnectionSubscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.inner
            .connection_handlers
            .lock()
            .push((id, Arc::new(handler)));
        ConnectionSubscription {
            client: self.inner.clone(),
            id,
        }
    }
}

impl Default for RoverClient {
    fn default() -> Self {
        Self::new(RoverConfig::default())
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn target_string(&self) -> String {
        match self.target.lock().as_ref() {
            Some((host, port)) => format!("{host}:{port}"),
            None => "<no target>".to_string(),
        }
    }

    /// Invalidate the live transport: pending timers and the connection task
    /// see the generation change and stand down.
    fn teardown_transport(&self) {
        self.next_generation();
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.try_send(OutboundMessage::Shutdown);
        }
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
    }

    fn send_text(&self, text: String) -> Result<()> {
        if self.connection_state() != ConnectionState::Open {
            return Err(RoverError::NotConnected);
        }
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .try_send(OutboundMessage::Send(text))
                .map_err(|_| RoverError::NotConnected),
            None => Err(RoverError::NotConnected),
        }
    }

    fn handle_inbound(&self, raw: &str) {
        let message = raw.trim();
        match RobotMessage::classify(message) {
            RobotMessage::Ready => info!("controller ready"),
            RobotMessage::Identified => info!("identified by controller"),
            RobotMessage::MotorAck => debug!(%message, "motor command acknowledged"),
            RobotMessage::Telemetry(frame) => self.dispatch_frame(frame),
            RobotMessage::Unrecognized => debug!(%message, "dropping undecodable line"),
        }
    }

    fn dispatch_frame(&self, frame: TelemetryFrame) {
        let now = Instant::now();
        {
            let mut last = self.last_frame_at.lock();
            if let Some(prev) = *last {
                trace!(gap = ?now.duration_since(prev), "telemetry frame");
            }
            *last = Some(now);
        }

        let handlers: Vec<DataHandler> = self
            .data_handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                error!("data subscriber panicked; continuing with the rest");
            }
        }
    }

    fn notify_connection(&self, connected: bool) {
        let handlers: Vec<ConnectionHandler> = self
            .connection_handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(connected))).is_err() {
                error!("connection subscriber panicked; continuing with the rest");
            }
        }
    }

    /// Schedule one bounded retry after an unexpected close.
    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.config.auto_reconnect {
            return;
        }

        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= self.config.max_reconnect_attempts {
            info!(
                attempts,
                "reconnect budget exhausted; waiting for an explicit connect"
            );
            return;
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            attempt,
            max = self.config.max_reconnect_attempts,
            delay = ?self.config.reconnect_interval,
            "scheduling reconnect"
        );

        let inner = Arc::clone(self);
        let scheduled_generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.reconnect_interval).await;

            // A manual connect or disconnect in the meantime supersedes this retry
            if !inner.is_current(scheduled_generation) {
                debug!("retry superseded");
                return;
            }
            if inner.connection_state() != ConnectionState::Disconnected {
                return;
            }

            let generation = inner.next_generation();
            inner.set_state(ConnectionState::Connecting);
            connection_task(inner.clone(), generation, true).await;
        });
    }
}

/// One connection's lifetime: open the transport, run the handshake, pump
/// messages until close or shutdown.
///
/// `retrying` marks an automatic reconnect attempt: its open failures chain
/// the next retry, while an explicit connect's failure is only surfaced
/// through the caller's `connect` future.
async fn connection_task(inner: Arc<ClientInner>, generation: u64, retrying: bool) {
    let Some((host, port)) = inner.target.lock().clone() else {
        inner.set_state(ConnectionState::Disconnected);
        return;
    };
    let url = format!("ws://{host}:{port}/");
    debug!(%url, "opening transport");

    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(%url, error = %e, "transport open failed");
            if !inner.is_current(generation) {
                return;
            }
            *inner.last_error.lock() = Some(e.to_string());
            inner.set_state(ConnectionState::Disconnected);
            if retrying {
                inner.schedule_reconnect();
            }
            return;
        }
    };

    if !inner.is_current(generation) {
        // Superseded while opening; drop the socket without touching state
        return;
    }

    info!(%url, "transport open");
    inner.reconnect_attempts.store(0, Ordering::SeqCst);
    *inner.last_error.lock() = None;

    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_QUEUE);
    *inner.tx.lock() = Some(tx.clone());

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    *inner.shutdown.lock() = Some(shutdown_tx);

    inner.set_state(ConnectionState::Open);
    inner.notify_connection(true);

    // Identification handshake, fire-and-forget after a settle delay
    let handshake_inner = inner.clone();
    let handshake_tx = tx.clone();
    let handshake_delay = inner.config.handshake_delay;
    tokio::spawn(async move {
        tokio::time::sleep(handshake_delay).await;
        if handshake_inner.is_current(generation)
            && handshake_inner.connection_state() == ConnectionState::Open
        {
            debug!("sending identification token");
            if handshake_tx
                .send(OutboundMessage::Send(IDENT_TOKEN.to_string()))
                .await
                .is_err()
            {
                debug!("identification skipped: transport already gone");
            }
        }
    });

    let (mut ws_tx, mut ws_rx) = stream.split();

    loop {
        tokio::select! {
            // Outbound messages
            msg = rx.recv() => {
                match msg {
                    Some(OutboundMessage::Send(text)) => {
                        trace!(%text, "sending");
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            warn!(error = %e, "send failed");
                            break;
                        }
                    }
                    Some(OutboundMessage::Shutdown) | None => break,
                }
            }

            // Inbound messages
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_inbound(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        inner.handle_inbound(&text);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("transport closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {
                        // ping/pong handled by the transport
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        break;
                    }
                }
            }

            // Manager-initiated shutdown
            _ = &mut shutdown_rx => break,
        }
    }

    if !inner.is_current(generation) {
        // disconnect() or a superseding connect already settled our state
        return;
    }

    // Unexpected close: surface it and start the bounded retry path
    *inner.tx.lock() = None;
    inner.set_state(ConnectionState::Disconnected);
    inner.notify_connection(false);
    inner.schedule_reconnect();
}
