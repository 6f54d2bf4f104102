//! In-process loopback transport.
//!
//! [`MemoryTransport`] hands every opened socket's far end to a
//! [`MemoryListener`] as a [`MemoryPeer`]. The peer decides when the socket
//! opens, pushes inbound frames, raises errors and closes, so connection
//! lifecycles can be driven step by step without a network.
//!
//! ```ignore
//! let (transport, mut listener) = MemoryTransport::pair();
//! let client = Client::builder(config).transport(transport).build();
//!
//! let connecting = tokio::spawn({ let c = client.clone(); async move { c.connect().await } });
//! let peer = listener.accept().await.unwrap();
//! peer.open();
//! connecting.await??;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Payload, ReadyState, SharedReadyState, Socket, SocketHandle, Transport, TransportEvent};
use crate::error::ClientError;

/// State shared by the two ends of one memory socket.
#[derive(Debug)]
struct Link {
    state: SharedReadyState,
    events: mpsc::UnboundedSender<TransportEvent>,
    auto_close_ack: AtomicBool,
}

impl Link {
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn finish(&self, code: u16, reason: &str) -> bool {
        if self.state.advance(ReadyState::Closed) == ReadyState::Closed {
            return false;
        }
        self.emit(TransportEvent::Close {
            code,
            reason: reason.to_string(),
        });
        true
    }
}

/// Client side of a memory socket.
#[derive(Debug)]
struct MemorySocketHandle {
    link: Arc<Link>,
    outbound: mpsc::UnboundedSender<Payload>,
}

impl SocketHandle for MemorySocketHandle {
    fn send(&self, payload: Payload) -> Result<(), ClientError> {
        if self.link.state.get() != ReadyState::Open {
            return Err(ClientError::SendFailed("socket is not open".to_string()));
        }
        self.outbound
            .send(payload)
            .map_err(|e| ClientError::SendFailed(format!("peer gone: {e}")))
    }

    fn close(&self) {
        match self.link.state.advance(ReadyState::Closing) {
            ReadyState::Closing | ReadyState::Closed => {}
            ReadyState::Connecting | ReadyState::Open => {
                if self.link.auto_close_ack.load(Ordering::SeqCst) {
                    self.link.finish(1000, "client requested close");
                }
            }
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.link.state.get()
    }
}

/// Far end of a memory socket, controlled by the test or embedding code.
#[derive(Debug)]
pub struct MemoryPeer {
    link: Arc<Link>,
    outbound: mpsc::UnboundedReceiver<Payload>,
    address: String,
    protocols: Vec<String>,
}

impl MemoryPeer {
    /// Address the client asked for.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sub-protocols the client requested, in order.
    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Complete the handshake. Returns `false` if the socket is no longer
    /// connecting.
    pub fn open(&self) -> bool {
        if self.link.state.get() != ReadyState::Connecting {
            return false;
        }
        self.link.state.set(ReadyState::Open);
        self.link.emit(TransportEvent::Open)
    }

    /// Deliver a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.deliver(Payload::Text(text.into()))
    }

    /// Deliver a binary frame to the client.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.deliver(Payload::Binary(data.into()))
    }

    fn deliver(&self, payload: Payload) -> bool {
        if self.link.state.get() == ReadyState::Closed {
            return false;
        }
        self.link.emit(TransportEvent::Message(payload))
    }

    /// Raise a transport error on the client side.
    pub fn error(&self, message: impl Into<String>) -> bool {
        if self.link.state.get() == ReadyState::Closed {
            return false;
        }
        self.link.emit(TransportEvent::Error(message.into()))
    }

    /// Close the socket from the far end. Returns `false` if already closed.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.link.finish(code, reason)
    }

    /// Whether the client closes are acknowledged immediately (default `true`).
    ///
    /// When disabled, a client `close()` leaves the socket in `Closing` until
    /// [`Self::close`] is called.
    pub fn set_auto_close_ack(&self, enabled: bool) {
        self.link.auto_close_ack.store(enabled, Ordering::SeqCst);
    }

    /// Next frame written by the client, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.outbound.recv().await
    }

    /// Next frame written by the client, without waiting.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.outbound.try_recv().ok()
    }

    /// Current socket state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.link.state.get()
    }
}

/// Receives the far ends of sockets opened through a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next socket opened by the client.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Take an already opened socket without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

/// Loopback [`Transport`]. Cheap to clone; clones share one listener.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Create a transport and the listener that receives its peers.
    #[must_use]
    pub fn pair() -> (Self, MemoryListener) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: peers_tx,
                refusing: Arc::new(AtomicBool::new(false)),
            },
            MemoryListener { peers: peers_rx },
        )
    }

    /// Make subsequent `open` calls fail synchronously.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn open(&self, address: &str, protocols: &[String]) -> Result<Socket, ClientError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionFailed(format!(
                "{address} refused the connection"
            )));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            state: SharedReadyState::default(),
            events: event_tx,
            auto_close_ack: AtomicBool::new(true),
        });

        let peer = MemoryPeer {
            link: Arc::clone(&link),
            outbound: outbound_rx,
            address: address.to_string(),
            protocols: protocols.to_vec(),
        };
        self.peers
            .send(peer)
            .map_err(|e| ClientError::ConnectionFailed(format!("listener dropped: {e}")))?;

        Ok(Socket {
            handle: Arc::new(MemorySocketHandle {
                link,
                outbound: outbound_tx,
            }),
            events: event_rx,
        })
    }
}
