//! Public client facade.
//!
//! [`Client`] is a cheap, cloneable handle over one connection. Build it with
//! [`Client::builder`], register message schemas, attach listeners, then
//! [`Client::connect`]:
//!
//! ```ignore
//! let client = Client::builder(ClientConfig::new("wss://example.com/socket"))
//!     .on_error(|e| eprintln!("{e}"))
//!     .build();
//! client.register(Schema::of::<Ping>("ping"));
//! client.register(Schema::of::<Pong>("pong"));
//! client.connect().await?;
//!
//! let pong = client.query::<Pong>(&Ping { id: 7 }).await?;
//! client.close().await;
//! ```

use std::sync::Arc;

use crate::codec::{Codec, JsonCodec, Schema};
use crate::config::ClientConfig;
use crate::connection::{Callbacks, Connection, ConnectionState};
use crate::dispatch::Handler;
use crate::error::ClientError;
use crate::message::{Kind, Message, Outbound, TransactionId};
use crate::query::QueryHandle;
use crate::transport::{Transport, WsTransport};

/// Builder for [`Client`].
#[must_use]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    codec: Option<Box<dyn Codec>>,
    callbacks: Callbacks,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            codec: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Transport used to open sockets. Defaults to [`WsTransport`].
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Codec used to encode and decode messages. Defaults to [`JsonCodec`].
    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    /// Receive lifecycle log lines (also emitted through the `log` crate).
    pub fn on_log(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_log = Some(Arc::new(f));
        self
    }

    /// Receive background errors: transport errors, handler failures,
    /// reconnect notices and failed sends.
    pub fn on_error(mut self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Called every time the transport opens.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect = Some(Arc::new(f));
        self
    }

    /// Called once per transport close.
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Build the client. Does not connect.
    pub fn build(self) -> Client {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WsTransport::new()));
        let codec = self.codec.unwrap_or_else(|| Box::new(JsonCodec::new()));
        Client {
            connection: Arc::new(Connection::new(
                self.config,
                transport,
                codec,
                self.callbacks,
            )),
        }
    }
}

/// Handle to a resilient socket connection.
#[derive(Debug, Clone)]
pub struct Client {
    connection: Arc<Connection>,
}

impl Client {
    /// Start building a client for `config`.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Client with the default transport and codec and no callbacks.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    /// Open the connection and wait until it is established.
    ///
    /// Arms automatic reconnection (if enabled in the config) until
    /// [`Self::close`] is called.
    ///
    /// # Errors
    ///
    /// - `ClientError::InvalidState` if already connecting or connected.
    /// - `ClientError::ConnectionFailed` if the transport cannot be opened or
    ///   closes before opening. The error is also passed to `on_error`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    /// Send text, raw bytes, or a registered message without waiting for a
    /// reply.
    ///
    /// Failures (not connected, unregistered message type) are reported via
    /// `on_error`.
    pub fn send<'a>(&self, data: impl Into<Outbound<'a>>) {
        self.connection.send(data.into());
    }

    /// Encode and send a registered message.
    pub fn send_message(&self, message: &dyn Message) {
        self.connection.send(Outbound::Message(message));
    }

    /// Send `message` and wait for the reply carrying the same transaction id.
    ///
    /// The returned handle fails immediately with `QueryError::NotSent` when
    /// the client is not connected or the message cannot be encoded, and with
    /// `QueryError::DuplicateTransaction` if the id is already in flight.
    pub fn query<R: Message>(&self, message: &dyn Message) -> QueryHandle<R> {
        self.connection.query(message)
    }

    /// Call `handler` for every unsolicited inbound item of `kind`.
    ///
    /// Use [`Kind::Text`], [`Kind::Binary`] or [`Kind::of`] for a message type.
    pub fn listen(&self, kind: Kind, handler: Handler) {
        self.connection.dispatch_table().listen(kind, handler);
    }

    /// Remove the first registration of `handler` for `kind`.
    ///
    /// Returns `false` if it was not registered.
    pub fn cancel(&self, kind: Kind, handler: &Handler) -> bool {
        self.connection.dispatch_table().cancel(kind, handler)
    }

    /// Close the connection for good.
    ///
    /// Disarms reconnection, stops the timeout sweep, removes every listener,
    /// and waits for the transport to confirm the close. Pending queries are
    /// cancelled.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Make a message type known to the codec.
    pub fn register(&self, schema: Schema) {
        self.connection.register(schema);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Number of queries waiting for a reply.
    #[must_use]
    pub fn pending_queries(&self) -> usize {
        self.connection.queries().len()
    }

    /// Whether a query with transaction id `id` is waiting for a reply.
    #[must_use]
    pub fn is_pending(&self, id: TransactionId) -> bool {
        self.connection.queries().contains(id)
    }

    /// Configuration the client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.connection.config()
    }
}

/// Build a client with default transport and codec and connect it.
///
/// # Errors
///
/// Returns the error from [`Client::connect`].
pub async fn connect(config: ClientConfig) -> Result<Client, ClientError> {
    let client = Client::new(config);
    client.connect().await?;
    Ok(client)
}
