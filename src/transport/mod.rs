//! Transport abstraction.
//!
//! A [`Transport`] opens duplex sockets. Opening is non-blocking: it returns a
//! [`Socket`] immediately, and the socket reports its progress through an
//! ordered stream of [`TransportEvent`]s (`Open`, `Message`, `Error`,
//! `Close`). Each event is delivered exactly once, in order, on the socket's
//! event receiver.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── WsTransport      WebSocket via tokio-tungstenite
//!     │
//!     └── MemoryTransport  in-process loopback (MemoryPeer drives the far end)
//! ```
//!
//! Rust guideline compliant 2026-02

pub mod memory;
pub mod ws;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// A frame travelling over a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

/// Notification emitted by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open and can send.
    Open,
    /// A frame arrived.
    Message(Payload),
    /// A transport or protocol error occurred. A `Close` follows if the
    /// socket cannot continue.
    Error(String),
    /// The socket is closed. Always the last event.
    Close {
        /// WebSocket-style close code (1000 = normal, 1006 = abnormal).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Lifecycle of a single socket, mirroring the WebSocket `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    /// Handshake in progress.
    #[default]
    Connecting,
    /// Open and able to send.
    Open,
    /// Close requested, waiting for acknowledgment.
    Closing,
    /// Closed.
    Closed,
}

/// Send/close side of an open socket.
pub trait SocketHandle: Send + Sync + std::fmt::Debug {
    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::SendFailed` if the socket is not open.
    fn send(&self, payload: Payload) -> Result<(), ClientError>;

    /// Request a graceful close. Completion is signalled by a `Close` event.
    fn close(&self);

    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState;
}

/// A freshly opened socket: its handle plus its ordered event stream.
#[derive(Debug)]
pub struct Socket {
    /// Handle used to send and close.
    pub handle: Arc<dyn SocketHandle>,
    /// Events emitted by the socket, ending with `Close`.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens sockets to an address.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Start opening a socket to `address`, requesting `protocols`.
    ///
    /// Returns as soon as the attempt has started; success is reported by an
    /// `Open` event on [`Socket::events`].
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionFailed` if the attempt cannot even be
    /// started (malformed address, no runtime).
    fn open(&self, address: &str, protocols: &[String]) -> Result<Socket, ClientError>;
}

/// Shared ready-state cell used by the transport implementations.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedReadyState {
    state: Arc<Mutex<ReadyState>>,
}

impl SharedReadyState {
    pub(crate) fn get(&self) -> ReadyState {
        *self.state.lock().expect("ready state lock poisoned")
    }

    pub(crate) fn set(&self, new_state: ReadyState) {
        *self.state.lock().expect("ready state lock poisoned") = new_state;
    }

    /// Move to `to` unless already `Closed`. Returns the previous state.
    pub(crate) fn advance(&self, to: ReadyState) -> ReadyState {
        let mut state = self.state.lock().expect("ready state lock poisoned");
        let previous = *state;
        if previous != ReadyState::Closed {
            *state = to;
        }
        previous
    }
}

pub use memory::{MemoryPeer, MemoryTransport};
pub use ws::WsTransport;
