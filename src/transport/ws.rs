//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves, plus the [`WsTransport`] adapter that drives one
//! socket per spawned task.
//!
//! # Architecture
//!
//! [`WsTransport::open`] builds the handshake request synchronously (so a
//! malformed address fails immediately), then spawns a task that performs the
//! handshake and runs a `tokio::select!` loop over the reader half and the
//! handle's command queue. Everything the task observes is forwarded as a
//! [`TransportEvent`].

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use super::{Payload, ReadyState, SharedReadyState, Socket, SocketHandle, Transport, TransportEvent};
use crate::error::ClientError;

/// How long a client-initiated close waits for the server's close frame.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Concrete WebSocket stream type (avoids repeating the 6-line generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Binary(data.to_vec()))
            .await
            .context("WebSocket send_binary failed")
    }

    /// Send a close frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send_close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames — skip
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Build the handshake request for `url`.
///
/// `protocols` are offered through `Sec-WebSocket-Protocol` in order; each
/// `(name, value)` header is inserted as-is.
///
/// # Errors
///
/// Returns an error if the URL is invalid, is not `ws://`/`wss://`, has no
/// host, or a header is malformed.
pub fn build_request(
    url: &str,
    protocols: &[String],
    headers: &[(String, String)],
) -> Result<tungstenite::handshake::client::Request> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    match request.uri().scheme_str() {
        Some("ws" | "wss") => {}
        Some(scheme) => anyhow::bail!("unsupported scheme {scheme:?} in WebSocket URL: {url}"),
        None => anyhow::bail!("missing ws:// or wss:// scheme in WebSocket URL: {url}"),
    }
    if request.uri().host().is_none() {
        anyhow::bail!("missing host in WebSocket URL: {url}");
    }

    if !protocols.is_empty() {
        let value = tungstenite::http::HeaderValue::from_str(&protocols.join(", "))
            .context("invalid sub-protocol list")?;
        request
            .headers_mut()
            .insert(tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL, value);
    }

    for (name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    Ok(request)
}

/// Perform the WebSocket handshake. Returns split (writer, reader) halves for
/// independent use in `tokio::select!` loops.
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails.
pub async fn connect(
    request: tungstenite::handshake::client::Request,
) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}

/// Command from a [`WsSocketHandle`] to its socket task.
#[derive(Debug)]
enum WsCommand {
    Send(Payload),
    Close,
}

/// Handle to a socket driven by [`WsTransport`].
#[derive(Debug)]
struct WsSocketHandle {
    commands: mpsc::UnboundedSender<WsCommand>,
    state: SharedReadyState,
}

impl SocketHandle for WsSocketHandle {
    fn send(&self, payload: Payload) -> Result<(), ClientError> {
        if self.state.get() != ReadyState::Open {
            return Err(ClientError::SendFailed("socket is not open".to_string()));
        }
        self.commands
            .send(WsCommand::Send(payload))
            .map_err(|e| ClientError::SendFailed(format!("socket task gone: {e}")))
    }

    fn close(&self) {
        match self.state.advance(ReadyState::Closing) {
            ReadyState::Closing | ReadyState::Closed => {}
            ReadyState::Connecting | ReadyState::Open => {
                // Task may already be gone; its Close event was emitted then.
                let _ = self.commands.send(WsCommand::Close);
            }
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }
}

/// WebSocket [`Transport`] backed by `tokio-tungstenite`.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    headers: Vec<(String, String)>,
}

impl WsTransport {
    /// Create a transport with no extra handshake headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every handshake (e.g. `Authorization`).
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl Transport for WsTransport {
    fn open(&self, address: &str, protocols: &[String]) -> Result<Socket, ClientError> {
        let url = http_to_ws_scheme(address);
        let request = build_request(&url, protocols, &self.headers)
            .map_err(|e| ClientError::ConnectionFailed(format!("{e:#}")))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::ConnectionFailed(format!("no tokio runtime: {e}")))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = SharedReadyState::default();

        runtime.spawn(run_socket(request, command_rx, event_tx, state.clone()));

        Ok(Socket {
            handle: Arc::new(WsSocketHandle {
                commands: command_tx,
                state,
            }),
            events: event_rx,
        })
    }
}

/// Emit the final `Close` event and mark the socket closed.
fn finish(
    events: &mpsc::UnboundedSender<TransportEvent>,
    state: &SharedReadyState,
    code: u16,
    reason: impl Into<String>,
) {
    state.set(ReadyState::Closed);
    let _ = events.send(TransportEvent::Close {
        code,
        reason: reason.into(),
    });
}

/// Drive one WebSocket from handshake to close.
async fn run_socket(
    request: tungstenite::handshake::client::Request,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: SharedReadyState,
) {
    let uri = request.uri().to_string();

    let connected = tokio::select! {
        result = connect(request) => result,
        _ = commands.recv() => {
            log::debug!("Close requested before {} opened", uri);
            finish(&events, &state, 1000, "closed before open");
            return;
        }
    };

    let (mut writer, mut reader) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("Failed to connect to {}: {:#}", uri, e);
            let _ = events.send(TransportEvent::Error(format!("{e:#}")));
            finish(&events, &state, 1006, "connection failed");
            return;
        }
    };

    if state.advance(ReadyState::Open) == ReadyState::Closing {
        // close() raced the handshake; honour it.
        state.set(ReadyState::Closing);
        let _ = writer.send_close().await;
        finish(&events, &state, 1000, "client requested close");
        return;
    }
    let _ = events.send(TransportEvent::Open);

    loop {
        tokio::select! {
            frame = reader.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(Payload::Text(text)));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        let _ = events.send(TransportEvent::Message(Payload::Binary(Bytes::from(data))));
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        // Pings are auto-replied by tungstenite; ignore pongs
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::debug!("WebSocket {} closed by server ({})", uri, code);
                        finish(&events, &state, code, reason);
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(format!("{e:#}")));
                        finish(&events, &state, 1006, "read error");
                        return;
                    }
                    None => {
                        // Stream ended without a Close frame
                        finish(&events, &state, 1006, "stream ended");
                        return;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(WsCommand::Send(payload)) => {
                        let result = match &payload {
                            Payload::Text(text) => writer.send_text(text).await,
                            Payload::Binary(data) => writer.send_binary(data).await,
                        };
                        if let Err(e) = result {
                            let _ = events.send(TransportEvent::Error(format!("{e:#}")));
                            finish(&events, &state, 1006, "write error");
                            return;
                        }
                    }
                    Some(WsCommand::Close) | None => {
                        let _ = writer.send_close().await;
                        let acked = tokio::time::timeout(CLOSE_ACK_TIMEOUT, async {
                            while let Some(Ok(frame)) = reader.recv().await {
                                if let WsMessage::Close { code, .. } = frame {
                                    return Some(code);
                                }
                            }
                            None
                        })
                        .await;
                        if acked.is_err() {
                            log::debug!("No close acknowledgment from {}", uri);
                        }
                        finish(&events, &state, 1000, "client requested close");
                        return;
                    }
                }
            }
        }
    }
}
