//! Message types for msgbus
//!
//! Defines the Message struct handed to and from the adapter, and the
//! broker-side properties it maps onto.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Broker message properties relevant to the adapter.
///
/// `None` means the property was not present on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// A text message.
///
/// Immutable once built: fields are only reachable through accessors, and
/// the `with_*` builders consume the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    body: String,

    /// Identifier set by the producer or broker, read-only for callers
    #[serde(default)]
    message_id: Option<String>,

    #[serde(default)]
    correlation_id: String,

    #[serde(default)]
    reply_to: String,
}

impl Message {
    /// Create a new message with the given body
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            message_id: None,
            correlation_id: String::new(),
            reply_to: String::new(),
        }
    }

    /// Create a new message whose body is the JSON encoding of `data`
    pub fn json<T: Serialize>(data: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_string(data)?))
    }

    /// Rebuild a message from a delivery body and its properties.
    ///
    /// Bodies that are not valid UTF-8 are decoded lossily.
    pub fn from_delivery(body: &[u8], properties: MessageProperties) -> Self {
        Self {
            body: String::from_utf8_lossy(body).into_owned(),
            message_id: properties.message_id,
            correlation_id: properties.correlation_id.unwrap_or_default(),
            reply_to: properties.reply_to.unwrap_or_default(),
        }
    }

    /// Set correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Set reply destination
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = reply_to.into();
        self
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Correlation id, empty when unset
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Reply destination, empty when unset
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Properties to attach when publishing.
    ///
    /// Correlation id and reply-to are always present, empty when unset.
    /// The message id is never sent.
    pub fn publish_properties(&self) -> MessageProperties {
        MessageProperties {
            message_id: None,
            correlation_id: Some(self.correlation_id.clone()),
            reply_to: Some(self.reply_to.clone()),
        }
    }

    /// Body encoded for the wire
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }

    /// Deserialize the body as JSON
    pub fn body_as_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}
