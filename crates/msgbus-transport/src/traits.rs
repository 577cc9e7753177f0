//! Transport trait definitions
//!
//! Defines the connection/channel interface every broker backend
//! implements. The shape follows AMQP 0.9.1: a connection multiplexes
//! channels, and all declarations and message operations happen on a
//! channel.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use msgbus_types::{ExchangeKind, Message, MessageProperties, Result};

/// Push deliveries for one consumer registration.
///
/// Ends when the consumer is cancelled or its channel closes. A lost
/// connection yields one `Error::Connection` item before the end.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A message as received from the broker
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery
    pub delivery_tag: u64,
    pub body: Bytes,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

impl Delivery {
    /// Rebuild the domain message carried by this delivery
    pub fn to_message(&self) -> Message {
        Message::from_delivery(&self.body, self.properties.clone())
    }
}

/// What the broker did with a mandatory publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Routed to at least one queue
    Routed,
    /// No queue matched; the broker returned the message
    Returned,
}

/// Entry point of a backend - opens connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection to the broker
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// An open broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection
    async fn create_channel(&self) -> Result<Box<dyn Channel>>;

    /// Close the connection and every channel still open on it
    async fn close(&self) -> Result<()>;
}

/// An open channel
#[async_trait]
pub trait Channel: Send + Sync {
    // ==================== Topology ====================

    /// Declare an exchange (auto-delete off, no arguments).
    ///
    /// Idempotent for identical attributes; a conflicting redeclaration
    /// fails with `Error::DeclarationConflict` and closes the channel.
    async fn exchange_declare(&self, name: &str, kind: &ExchangeKind, durable: bool) -> Result<()>;

    /// Declare a queue (non-exclusive, auto-delete off, no arguments)
    async fn queue_declare(&self, name: &str, durable: bool) -> Result<()>;

    /// Bind a queue to an exchange with a routing key
    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    // ==================== Messages ====================

    /// Publish with the mandatory flag set
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishOutcome>;

    /// Fetch the next message without blocking; it is acknowledged on retrieval
    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Register a push consumer requiring manual acknowledgment
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Acknowledge a single delivery
    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    /// Withdraw a consumer registration
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close the channel, returning unacknowledged deliveries to their queues
    async fn close(&self) -> Result<()>;
}
