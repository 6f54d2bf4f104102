//! connectme - resilient socket client.
//!
//! This crate wraps a duplex socket with automatic reconnection,
//! request/response correlation by transaction id, and typed dispatch of
//! unsolicited messages.
//!
//! # Architecture
//!
//! - **Client** - Public facade; cheap to clone, owns one connection
//! - **Connection** - State machine, one event task per socket, reconnect timer
//! - **Queries** - Pending-query table with a periodic timeout sweep
//! - **Dispatch** - Ordered handler lists keyed by message kind
//! - **Transport** - Socket abstraction (WebSocket and in-memory loopback)
//! - **Codec** - Message encoding (JSON by default)
//!
//! # Modules
//!
//! - [`client`] - `Client`, `ClientBuilder` and `connect`
//! - [`config`] - Configuration loading and environment overrides
//! - [`transport`] - `Transport` trait, `WsTransport`, `MemoryTransport`
//! - [`codec`] - `Codec` trait, `JsonCodec`, `Schema`

// Library modules
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod query;
pub mod transport;

pub mod constants;

// Re-export commonly used types
pub use client::{connect, Client, ClientBuilder};
pub use codec::{Codec, JsonCodec, Schema};
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::ConnectionState;
pub use dispatch::{handler, Handler, HandlerFuture};
pub use error::{ClientError, QueryError};
pub use message::{Inbound, Kind, Message, Outbound, TransactionId};
pub use query::QueryHandle;
pub use transport::{MemoryTransport, Payload, ReadyState, Transport, WsTransport};
