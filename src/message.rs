//! Domain message abstractions.
//!
//! A domain message is any type implementing [`Message`]: it carries a
//! transaction id that the client uses to pair a query with its reply.
//! Everything that arrives on the socket is surfaced as an [`Inbound`] item and
//! classified by its [`Kind`], which is what listeners are registered under.
//!
//! ```ignore
//! #[derive(Debug, Serialize, Deserialize)]
//! struct GetUser { transaction_id: u32, name: String }
//!
//! impl Message for GetUser {
//!     fn transaction_id(&self) -> TransactionId { self.transaction_id }
//! }
//!
//! client.listen(Kind::of::<GetUser>(), handler);
//! ```

use std::any::{Any, TypeId};
use std::sync::Arc;

use bytes::Bytes;

/// Identifier pairing a query with its reply.
pub type TransactionId = u32;

/// Type-erasure helpers implemented for every `'static` type.
///
/// This is a supertrait of [`Message`] so that decoded `dyn Message` values can
/// be downcast back to their concrete type.
pub trait AsAny: Any + Send + Sync {
    /// Borrow as `dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// Convert a shared pointer into `Arc<dyn Any>`.
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    /// Name of the concrete type, for logs.
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A domain message understood by a [`crate::Codec`].
pub trait Message: AsAny + std::fmt::Debug {
    /// Transaction id used to correlate replies with queries.
    fn transaction_id(&self) -> TransactionId;
}

impl dyn Message {
    /// Kind of the concrete message behind this trait object.
    pub fn kind(&self) -> Kind {
        Kind::Message {
            type_id: Any::type_id(AsAny::as_any(self)),
            name: AsAny::type_name(self),
        }
    }

    /// Downcast to a concrete message type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }
}

/// Downcast a shared message to its concrete type.
///
/// Returns the original pointer on mismatch.
pub fn downcast_message<T: Message>(
    message: Arc<dyn Message>,
) -> Result<Arc<T>, Arc<dyn Message>> {
    match AsAny::into_any_arc(Arc::clone(&message)).downcast::<T>() {
        Ok(concrete) => Ok(concrete),
        Err(_erased) => Err(message),
    }
}

/// Routing key for inbound items.
///
/// Text frames and undecodable binary frames have their own kinds; decoded
/// messages are keyed by their concrete Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame the codec could not decode.
    Binary,
    /// Decoded domain message.
    Message {
        /// Concrete message type.
        type_id: TypeId,
        /// Type name, for logs only.
        name: &'static str,
    },
}

impl Kind {
    /// Kind for the message type `T`.
    #[must_use]
    pub fn of<T: Message>() -> Self {
        Self::Message {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Binary => write!(f, "binary"),
            Self::Message { name, .. } => write!(f, "{name}"),
        }
    }
}

/// An item received from the socket that was not a query reply.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame the codec did not recognise.
    Binary(Bytes),
    /// Decoded domain message.
    Message(Arc<dyn Message>),
}

impl Inbound {
    /// Routing kind of this item.
    pub fn kind(&self) -> Kind {
        match self {
            Self::Text(_) => Kind::Text,
            Self::Binary(_) => Kind::Binary,
            Self::Message(msg) => msg.kind(),
        }
    }

    /// Borrow the decoded message as `T`, if this is one.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        match self {
            Self::Message(msg) => msg.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Text content, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Data accepted by [`crate::Client::send`].
#[derive(Debug, Clone, Copy)]
pub enum Outbound<'a> {
    /// Sent as a text frame.
    Text(&'a str),
    /// Pre-encoded bytes, sent as a binary frame.
    Binary(&'a [u8]),
    /// Domain message, encoded by the codec and sent as a binary frame.
    Message(&'a dyn Message),
}

impl<'a> From<&'a str> for Outbound<'a> {
    fn from(text: &'a str) -> Self {
        Self::Text(text)
    }
}

impl<'a> From<&'a String> for Outbound<'a> {
    fn from(text: &'a String) -> Self {
        Self::Text(text)
    }
}

impl<'a> From<&'a [u8]> for Outbound<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::Binary(data)
    }
}

impl<'a> From<&'a Vec<u8>> for Outbound<'a> {
    fn from(data: &'a Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

impl<'a> From<&'a Bytes> for Outbound<'a> {
    fn from(data: &'a Bytes) -> Self {
        Self::Binary(data)
    }
}
