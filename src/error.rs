//! Error types for the client.
//!
//! Two families exist. [`ClientError`] covers everything that happens in the
//! background (transport failures, handler failures, reconnect notices) and is
//! delivered through the single `on_error` callback. [`QueryError`] is scoped
//! to one query and only ever reaches the caller awaiting that query.

use crate::message::{Kind, TransactionId};

/// Errors reported through the client's error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The transport could not be opened, or closed before it opened.
    ConnectionFailed(String),
    /// Writing to the transport failed or the transport is not open.
    SendFailed(String),
    /// The transport reported an error event.
    Transport(String),
    /// The connection was lost and a reconnect attempt is scheduled.
    Reconnecting {
        /// Address that will be reconnected to.
        address: String,
        /// Milliseconds until the next attempt.
        delay_ms: u64,
    },
    /// A message handler returned an error or panicked.
    HandlerFailed {
        /// Kind the failing handler was registered for.
        kind: Kind,
        /// Error or panic message.
        message: String,
    },
    /// Data passed to `send` cannot be put on the wire.
    UnsupportedPayload(String),
    /// A query could not be issued.
    Query(QueryError),
    /// The operation is not valid in the current connection state.
    InvalidState(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Reconnecting { address, delay_ms } => write!(
                f,
                "Connection to {address} was closed, reconnect in {:.1} seconds...",
                *delay_ms as f64 / 1000.0
            ),
            Self::HandlerFailed { kind, message } => {
                write!(f, "Message handler execution error ({kind}): {message}")
            }
            Self::UnsupportedPayload(msg) => write!(f, "Unsupported payload: {msg}"),
            Self::Query(err) => write!(f, "Query failed: {err}"),
            Self::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Query(err) => Some(err),
            _ => None,
        }
    }
}

impl From<QueryError> for ClientError {
    fn from(err: QueryError) -> Self {
        Self::Query(err)
    }
}

/// Errors delivered to the caller awaiting a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// No reply arrived within the configured query timeout.
    Timeout(TransactionId),
    /// The connection closed while the query was pending.
    Cancelled(TransactionId),
    /// The query was never written to the transport.
    NotSent(String),
    /// Another query with the same transaction id is still in flight.
    DuplicateTransaction(TransactionId),
    /// The reply decoded to a different message type than requested.
    UnexpectedReply(TransactionId),
    /// The pending entry was dropped without being completed.
    Abandoned,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(id) => write!(f, "query {id} response timed out"),
            Self::Cancelled(id) => write!(f, "query {id} cancelled due to socket close"),
            Self::NotSent(msg) => write!(f, "query not sent: {msg}"),
            Self::DuplicateTransaction(id) => {
                write!(f, "transaction {id} already has a pending query")
            }
            Self::UnexpectedReply(id) => write!(f, "reply to query {id} has an unexpected type"),
            Self::Abandoned => write!(f, "query abandoned"),
        }
    }
}

impl std::error::Error for QueryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnecting_message_mentions_delay() {
        let err = ClientError::Reconnecting {
            address: "ws://localhost:9000".to_string(),
            delay_ms: 3000,
        };
        assert_eq!(
            err.to_string(),
            "Connection to ws://localhost:9000 was closed, reconnect in 3.0 seconds..."
        );
    }

    #[test]
    fn test_query_error_source_is_exposed() {
        use std::error::Error;

        let err = ClientError::from(QueryError::Timeout(4));
        assert_eq!(err.source().map(ToString::to_string), Some("query 4 response timed out".to_string()));
    }

    #[test]
    fn test_handler_failed_display() {
        let err = ClientError::HandlerFailed {
            kind: Kind::Text,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Message handler execution error (text): boom");
    }
}
