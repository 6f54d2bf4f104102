//! Connection state machine.
//!
//! [`Connection`] owns one transport socket at a time together with the query
//! table, the dispatch table and the user callbacks. Each socket gets its own
//! event task which processes the socket's [`TransportEvent`]s in order:
//!
//! ```text
//!  connect() ──► Connecting ──Open──► Connected
//!                    │                    │
//!                    └──────Close─────────┤
//!                                         ▼
//!                     armed && auto_reconnect?
//!                        │yes                 │no
//!                        ▼                    ▼
//!              Reconnecting ──delay──►    Disconnected
//!              connect() again
//!
//!  close() ──► Closing ──Close──► Closed
//! ```
//!
//! Every `Close` cancels all pending queries before anything else happens,
//! then fires `on_disconnect` exactly once.
//!
//! # Locking
//!
//! The `socket` slot doubles as the lifecycle lock: the reconnect path checks
//! the armed flag and installs a new socket while holding it, and `close()`
//! disarms before taking it. A reconnect racing a close therefore either sees
//! the flag cleared or hands its socket to `close()`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::codec::{Codec, Schema};
use crate::config::ClientConfig;
use crate::dispatch::DispatchTable;
use crate::error::{ClientError, QueryError};
use crate::message::{Inbound, Message, Outbound, TransactionId};
use crate::query::{QueryHandle, QueryTable};
use crate::transport::{Payload, ReadyState, SocketHandle, Transport, TransportEvent};

/// Observable state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected and no reconnect scheduled.
    #[default]
    Disconnected,
    /// Waiting for the transport to open.
    Connecting,
    /// Open; queries and sends go out.
    Connected,
    /// Lost the connection; a new attempt is scheduled.
    Reconnecting {
        /// Consecutive attempts since the last successful open.
        attempt: u32,
        /// Milliseconds until the attempt starts.
        next_retry_ms: u64,
    },
    /// `close()` is waiting for the transport to confirm.
    Closing,
    /// Closed by `close()`. `connect()` may be called again.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt, .. } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Receives lifecycle log lines.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Receives background errors.
pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;
/// Fired on connect or disconnect.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Optional user callbacks.
#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    pub(crate) on_log: Option<LogCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_connect: Option<LifecycleCallback>,
    pub(crate) on_disconnect: Option<LifecycleCallback>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_log", &self.on_log.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Shared state behind a [`crate::Client`].
pub(crate) struct Connection {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    codec: RwLock<Box<dyn Codec>>,
    queries: QueryTable,
    dispatch: DispatchTable,
    callbacks: Callbacks,
    state: Mutex<ConnectionState>,
    socket: Mutex<Option<Arc<dyn SocketHandle>>>,
    /// Id of the most recently opened socket.
    generation: AtomicU64,
    /// Id of the most recent socket whose close has been fully processed.
    closed_generation: watch::Sender<u64>,
    armed: AtomicBool,
    /// Reconnect attempts since the last successful open.
    attempts: AtomicU32,
    sweep: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.config.address)
            .field("state", &self.state())
            .field("pending_queries", &self.queries.len())
            .field("dispatch", &self.dispatch)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        codec: Box<dyn Codec>,
        callbacks: Callbacks,
    ) -> Self {
        let (closed_generation, _) = watch::channel(0);
        Self {
            config,
            transport,
            codec: RwLock::new(codec),
            queries: QueryTable::new(),
            dispatch: DispatchTable::new(),
            callbacks,
            state: Mutex::new(ConnectionState::Disconnected),
            socket: Mutex::new(None),
            generation: AtomicU64::new(0),
            closed_generation,
            armed: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            sweep: Mutex::new(None),
            reconnect: Mutex::new(None),
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn queries(&self) -> &QueryTable {
        &self.queries
    }

    pub(crate) fn dispatch_table(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    fn set_state(&self, new_state: ConnectionState) {
        *self.state.lock().expect("connection state lock poisoned") = new_state;
    }

    pub(crate) fn register(&self, schema: Schema) {
        log::debug!("Registering schema {}", schema.name());
        self.codec
            .write()
            .expect("codec lock poisoned")
            .register(schema);
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    fn log(&self, message: &str) {
        log::info!("{}", message);
        if let Some(on_log) = &self.callbacks.on_log {
            on_log(message);
        }
    }

    fn report(&self, error: &ClientError) {
        match error {
            ClientError::Reconnecting { .. } => log::info!("{}", error),
            _ => log::warn!("{}", error),
        }
        if let Some(on_error) = &self.callbacks.on_error {
            on_error(error);
        }
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Open a socket and wait until it reports `Open`.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        self.open(false).await
    }

    /// Reconnect entry point used by the reconnect timer.
    ///
    /// Boxed so that the connect/event-loop/reconnect cycle has a nameable
    /// future type.
    fn reconnect(connection: Arc<Self>) -> BoxFuture<'static, Result<(), ClientError>> {
        async move { connection.open(true).await }.boxed()
    }

    async fn open(self: &Arc<Self>, reconnecting: bool) -> Result<(), ClientError> {
        self.begin(reconnecting)?;
        self.ensure_sweep();
        self.log(&format!("Connecting to {}...", self.config.address));

        let (generation, events) = match self.install_socket(reconnecting) {
            Ok(opened) => opened,
            Err(error) => {
                if !matches!(error, ClientError::InvalidState(_)) {
                    self.report(&error);
                }
                if reconnecting && self.armed.load(Ordering::SeqCst) {
                    self.schedule_reconnect();
                } else if self.state() == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Disconnected);
                }
                return Err(error);
            }
        };

        let (opened_tx, opened_rx) = oneshot::channel();
        tokio::spawn(Self::run_events(
            Arc::downgrade(self),
            generation,
            events,
            opened_tx,
        ));

        match opened_rx.await {
            Ok(result) => result,
            Err(_dropped) => Err(ClientError::ConnectionFailed(
                "socket task ended before the connection opened".to_string(),
            )),
        }
    }

    /// Validate the current state and move to `Connecting`.
    fn begin(&self, reconnecting: bool) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        match *state {
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Closing => {
                return Err(ClientError::InvalidState(format!(
                    "cannot connect while {}",
                    *state
                )));
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting { .. }
            | ConnectionState::Closed => {}
        }

        if reconnecting {
            if !self.armed.load(Ordering::SeqCst) {
                return Err(ClientError::InvalidState(
                    "reconnect cancelled by close".to_string(),
                ));
            }
        } else {
            self.armed.store(true, Ordering::SeqCst);
            self.attempts.store(0, Ordering::SeqCst);
            if let Some(task) = self
                .reconnect
                .lock()
                .expect("reconnect task lock poisoned")
                .take()
            {
                task.abort();
            }
        }

        *state = ConnectionState::Connecting;
        Ok(())
    }

    /// Open a transport socket and make it current.
    fn install_socket(
        &self,
        reconnecting: bool,
    ) -> Result<(u64, mpsc::UnboundedReceiver<TransportEvent>), ClientError> {
        let mut current = self.socket.lock().expect("socket lock poisoned");
        if reconnecting && !self.armed.load(Ordering::SeqCst) {
            drop(current);
            self.set_state(ConnectionState::Closed);
            return Err(ClientError::InvalidState(
                "reconnect cancelled by close".to_string(),
            ));
        }

        let socket = self
            .transport
            .open(&self.config.address, &self.config.protocols)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *current = Some(socket.handle);
        Ok((generation, socket.events))
    }

    fn ensure_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock().expect("sweep task lock poisoned");
        if sweep.is_some() {
            return;
        }

        let connection = Arc::downgrade(self);
        // interval_at panics on a zero period.
        let period = self.config.sweep_interval().max(Duration::from_millis(1));
        let timeout = self.config.query_timeout();
        *sweep = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                let expired = connection.queries.sweep_expired(Instant::now(), timeout);
                if expired > 0 {
                    log::debug!("Timed out {} pending queries", expired);
                }
            }
        }));
    }

    // ------------------------------------------------------------------
    // Socket events
    // ------------------------------------------------------------------

    async fn run_events(
        connection: Weak<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        opened: oneshot::Sender<Result<(), ClientError>>,
    ) {
        let mut opened = Some(opened);
        let mut is_open = false;

        while let Some(event) = events.recv().await {
            let Some(this) = connection.upgrade() else {
                return;
            };
            match event {
                TransportEvent::Open => {
                    is_open = true;
                    this.attempts.store(0, Ordering::SeqCst);
                    this.set_state(ConnectionState::Connected);
                    this.log("Connection established");
                    if let Some(opened) = opened.take() {
                        let _ = opened.send(Ok(()));
                    }
                    if let Some(on_connect) = &this.callbacks.on_connect {
                        on_connect();
                    }
                }
                TransportEvent::Message(payload) => {
                    if is_open {
                        this.route(payload);
                    } else {
                        log::debug!("Dropping frame received before open");
                    }
                }
                TransportEvent::Error(message) => {
                    this.report(&ClientError::Transport(message));
                }
                TransportEvent::Close { code, reason } => {
                    this.handle_close(generation, code, &reason, opened.take());
                    return;
                }
            }
        }

        // Event stream ended without a Close: treat it as an abnormal close.
        if let Some(this) = connection.upgrade() {
            this.handle_close(generation, 1006, "event stream ended", opened.take());
        }
    }

    fn handle_close(
        self: &Arc<Self>,
        generation: u64,
        code: u16,
        reason: &str,
        opened: Option<oneshot::Sender<Result<(), ClientError>>>,
    ) {
        log::debug!("Socket {} closed ({} {})", generation, code, reason);

        if let Some(opened) = opened {
            let error = ClientError::ConnectionFailed(format!(
                "{} closed before opening ({code} {reason})",
                self.config.address
            ));
            self.report(&error);
            let _ = opened.send(Err(error));
        }

        // A newer socket has replaced this one; its state belongs to that socket.
        if generation != self.generation.load(Ordering::SeqCst) {
            log::debug!("Ignoring close of superseded socket {}", generation);
            if let Some(on_disconnect) = &self.callbacks.on_disconnect {
                on_disconnect();
            }
            self.acknowledge_close(generation);
            return;
        }

        let cancelled = self.queries.cancel_all();
        if cancelled > 0 {
            log::debug!("Cancelled {} pending queries on close", cancelled);
        }

        if self.config.auto_reconnect && self.armed.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        } else {
            {
                let mut state = self.state.lock().expect("connection state lock poisoned");
                if !matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                    *state = ConnectionState::Disconnected;
                }
            }
            self.log(&format!("Disconnected from {}", self.config.address));
        }

        if let Some(on_disconnect) = &self.callbacks.on_disconnect {
            on_disconnect();
        }
        self.acknowledge_close(generation);
    }

    /// Wake `close()` calls waiting for `generation` to finish closing.
    fn acknowledge_close(&self, generation: u64) {
        self.closed_generation.send_modify(|closed| {
            *closed = (*closed).max(generation);
        });
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let delay = self.config.reconnect.delay(attempt);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        self.set_state(ConnectionState::Reconnecting {
            attempt,
            next_retry_ms: delay_ms,
        });
        self.report(&ClientError::Reconnecting {
            address: self.config.address.clone(),
            delay_ms,
        });

        let connection = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(connection) = connection.upgrade() else {
                return;
            };
            if !connection.armed.load(Ordering::SeqCst) {
                log::debug!("Reconnect suppressed, connection was closed");
                return;
            }
            if let Err(e) = Self::reconnect(connection).await {
                log::debug!("Reconnect attempt {} failed: {}", attempt, e);
            }
        });
        *self.reconnect.lock().expect("reconnect task lock poisoned") = Some(task);
    }

    /// Resolve a pending query or hand the item to the dispatch table.
    fn route(self: &Arc<Self>, payload: Payload) {
        let inbound = match payload {
            Payload::Text(text) => Inbound::Text(text),
            Payload::Binary(data) => {
                let decoded = self.codec.read().expect("codec lock poisoned").decode(&data);
                match decoded {
                    Some(message) => match self.queries.resolve(message) {
                        Some(unsolicited) => Inbound::Message(unsolicited),
                        None => return,
                    },
                    None => Inbound::Binary(data),
                }
            }
        };

        let connection = Arc::downgrade(self);
        self.dispatch.dispatch(&inbound, move |error: ClientError| {
            if let Some(connection) = connection.upgrade() {
                connection.report(&error);
            }
        });
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn open_socket(&self) -> Option<Arc<dyn SocketHandle>> {
        self.socket
            .lock()
            .expect("socket lock poisoned")
            .as_ref()
            .filter(|socket| socket.ready_state() == ReadyState::Open)
            .map(Arc::clone)
    }

    fn encode(&self, message: &dyn Message) -> Option<Bytes> {
        self.codec.read().expect("codec lock poisoned").encode(message)
    }

    pub(crate) fn send(&self, data: Outbound<'_>) {
        let payload = match data {
            Outbound::Text(text) => Payload::Text(text.to_string()),
            Outbound::Binary(bytes) => Payload::Binary(Bytes::copy_from_slice(bytes)),
            Outbound::Message(message) => match self.encode(message) {
                Some(bytes) => Payload::Binary(bytes),
                None => {
                    self.report(&ClientError::UnsupportedPayload(format!(
                        "{} is not registered with the codec",
                        message.kind()
                    )));
                    return;
                }
            },
        };

        let result = match self.open_socket() {
            Some(socket) => socket.send(payload),
            None => Err(ClientError::SendFailed(format!(
                "not connected to {}",
                self.config.address
            ))),
        };
        if let Err(error) = result {
            self.report(&error);
        }
    }

    pub(crate) fn query<R: Message>(&self, message: &dyn Message) -> QueryHandle<R> {
        let id = message.transaction_id();

        let Some(bytes) = self.encode(message) else {
            return self.fail_query(
                id,
                QueryError::NotSent(format!("{} is not registered with the codec", message.kind())),
            );
        };
        let Some(socket) = self.open_socket() else {
            return self.fail_query(
                id,
                QueryError::NotSent(format!("not connected to {}", self.config.address)),
            );
        };
        let receiver = match self.queries.insert(id) {
            Ok(receiver) => receiver,
            Err(error) => return self.fail_query(id, error),
        };

        if let Err(error) = socket.send(Payload::Binary(bytes)) {
            let error = QueryError::NotSent(error.to_string());
            self.report(&ClientError::Query(error.clone()));
            self.queries.reject(id, error);
        }
        QueryHandle::pending(id, receiver)
    }

    fn fail_query<R: Message>(&self, id: TransactionId, error: QueryError) -> QueryHandle<R> {
        self.report(&ClientError::Query(error.clone()));
        QueryHandle::failed(Some(id), error)
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    pub(crate) async fn close(&self) {
        self.armed.store(false, Ordering::SeqCst);
        if let Some(task) = self
            .reconnect
            .lock()
            .expect("reconnect task lock poisoned")
            .take()
        {
            task.abort();
        }
        if let Some(task) = self.sweep.lock().expect("sweep task lock poisoned").take() {
            task.abort();
        }
        self.dispatch.clear();

        let socket = self.socket.lock().expect("socket lock poisoned").take();
        let generation = self.generation.load(Ordering::SeqCst);
        let mut closed = self.closed_generation.subscribe();

        // A concurrent close() may already have taken the socket and still be
        // waiting; share its acknowledgment instead of finishing early.
        let awaiting_ack = match socket.filter(|s| s.ready_state() != ReadyState::Closed) {
            Some(socket) => {
                self.set_state(ConnectionState::Closing);
                socket.close();
                true
            }
            None => self.state() == ConnectionState::Closing,
        };
        if awaiting_ack && closed.wait_for(|closed| *closed >= generation).await.is_err() {
            log::debug!("Close acknowledgment channel dropped");
        }

        self.queries.cancel_all();
        self.set_state(ConnectionState::Closed);
        self.log(&format!("Connection to {} closed", self.config.address));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for slot in [&mut self.sweep, &mut self.reconnect] {
            if let Ok(task) = slot.get_mut() {
                if let Some(task) = task.take() {
                    task.abort();
                }
            }
        }
    }
}
