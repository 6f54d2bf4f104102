//! Message codec abstraction and the default JSON implementation.
//!
//! The client never inspects the wire format itself. It hands domain
//! messages to a [`Codec`] for encoding and offers every binary frame to
//! [`Codec::decode`]; a `None` result means "not a domain message" and the
//! frame is dispatched as raw binary instead.
//!
//! # JSON framing
//!
//! [`JsonCodec`] frames each message as a UTF-8 JSON object:
//!
//! ```text
//! {"kind": "<registered name>", "body": { ...serde representation... }}
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::Message;

type EncodeFn = Box<dyn Fn(&dyn Message) -> Option<serde_json::Value> + Send + Sync>;
type DecodeFn = Box<dyn Fn(serde_json::Value) -> Option<Arc<dyn Message>> + Send + Sync>;

/// Encoder/decoder pair for one message type.
pub struct Schema {
    name: String,
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Schema {
    /// Schema for `T`, identified on the wire by `name`.
    pub fn of<T>(name: impl Into<String>) -> Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        let name = name.into();
        let log_name = name.clone();
        Self {
            name,
            type_id: TypeId::of::<T>(),
            encode: Box::new(|message: &dyn Message| {
                let concrete = message.downcast_ref::<T>()?;
                serde_json::to_value(concrete).ok()
            }),
            decode: Box::new(move |body: serde_json::Value| match serde_json::from_value::<T>(body) {
                Ok(concrete) => Some(Arc::new(concrete) as Arc<dyn Message>),
                Err(e) => {
                    log::debug!("Failed to decode {} body: {}", log_name, e);
                    None
                }
            }),
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Encodes domain messages to bytes and back.
pub trait Codec: Send + Sync {
    /// Make a message type decodable.
    fn register(&mut self, schema: Schema);

    /// Encode a message, or `None` if its type is not registered.
    fn encode(&self, message: &dyn Message) -> Option<Bytes>;

    /// Decode a frame, or `None` if it is not a registered domain message.
    fn decode(&self, data: &[u8]) -> Option<Arc<dyn Message>>;
}

#[derive(Serialize)]
struct FrameOut<'a> {
    kind: &'a str,
    body: serde_json::Value,
}

#[derive(Deserialize)]
struct FrameIn {
    kind: String,
    body: serde_json::Value,
}

/// JSON codec keyed by registered wire names.
#[derive(Debug, Default)]
pub struct JsonCodec {
    by_name: HashMap<String, Schema>,
    names_by_type: HashMap<TypeId, String>,
}

impl JsonCodec {
    /// Create an empty codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered message types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no message type is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Codec for JsonCodec {
    fn register(&mut self, schema: Schema) {
        if let Some(previous) = self.names_by_type.insert(schema.type_id, schema.name.clone()) {
            if previous != schema.name {
                self.by_name.remove(&previous);
            }
        }
        log::debug!("Registered message schema {}", schema.name);
        self.by_name.insert(schema.name.clone(), schema);
    }

    fn encode(&self, message: &dyn Message) -> Option<Bytes> {
        let type_id = std::any::Any::type_id(crate::message::AsAny::as_any(message));
        let name = self.names_by_type.get(&type_id)?;
        let schema = self.by_name.get(name)?;
        let body = (schema.encode)(message)?;
        match serde_json::to_vec(&FrameOut { kind: name, body }) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                log::warn!("Failed to encode {}: {}", name, e);
                None
            }
        }
    }

    fn decode(&self, data: &[u8]) -> Option<Arc<dyn Message>> {
        let frame: FrameIn = serde_json::from_slice(data).ok()?;
        let schema = self.by_name.get(&frame.kind)?;
        (schema.decode)(frame.body)
    }
}
