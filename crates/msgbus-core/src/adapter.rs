//! Broker adapter - publish, drain and subscribe
//!
//! Every call opens its own connection and channel, declares the topology
//! it needs, does its work and releases both before returning, whether it
//! succeeded or not. Nothing is retried here.

use std::sync::Arc;

use msgbus_transport::{Channel, PublishOutcome, Transport};
use msgbus_types::{ConnectionSettings, Message, Result, Route};
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::subscription::{CancellationSignal, MessageHandler, Subscription, SubscriptionReport};

/// Declare the route's exchange, the queue, and bind them
pub(crate) async fn declare_binding(channel: &dyn Channel, route: &Route, queue: &str) -> Result<()> {
    channel
        .exchange_declare(&route.exchange, &route.kind, route.durable)
        .await?;
    channel.queue_declare(queue, route.durable).await?;
    channel
        .queue_bind(queue, &route.exchange, &route.routing_key)
        .await
}

/// Main broker adapter
#[derive(Clone)]
pub struct BrokerAdapter {
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
}

impl BrokerAdapter {
    /// Adapter talking AMQP to the broker named in `settings`
    #[cfg(feature = "amqp")]
    pub fn new(settings: ConnectionSettings) -> Self {
        let transport = msgbus_transport::AmqpTransport::new(settings.clone());
        Self::with_transport(settings, transport)
    }

    /// Adapter configured from `MSGBUS_*` environment variables
    #[cfg(feature = "amqp")]
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ConnectionSettings::from_env()?))
    }

    /// Adapter over any transport
    pub fn with_transport(settings: ConnectionSettings, transport: impl Transport + 'static) -> Self {
        info!(
            endpoint = %settings.endpoint(),
            automatic_recovery = settings.automatic_recovery,
            "Initializing broker adapter"
        );
        Self {
            settings,
            transport: Arc::new(transport),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    // ==================== Publish ====================

    /// Declare the route's exchange and publish `message` to it.
    ///
    /// The publish is mandatory; if the broker cannot route it the message
    /// is dropped by the broker and a warning is logged.
    pub async fn publish(&self, message: &Message, route: &Route) -> Result<()> {
        let session = Session::open(self.transport()).await?;
        let result = Self::publish_on(session.channel(), message, route).await;
        session.finish(result).await
    }

    async fn publish_on(channel: &dyn Channel, message: &Message, route: &Route) -> Result<()> {
        channel
            .exchange_declare(&route.exchange, &route.kind, route.durable)
            .await?;

        let outcome = channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                message.body_bytes(),
                &message.publish_properties(),
            )
            .await?;

        match outcome {
            PublishOutcome::Routed => debug!(
                exchange = %route.exchange,
                routing_key = %route.routing_key,
                "Message published"
            ),
            PublishOutcome::Returned => warn!(
                exchange = %route.exchange,
                routing_key = %route.routing_key,
                "Message was unroutable and returned by the broker"
            ),
        }
        Ok(())
    }

    // ==================== Drain ====================

    /// Take every message currently in `queue`, in retrieval order.
    ///
    /// The queue is declared and bound to the route first. Messages are
    /// acknowledged as they are fetched, so a second drain with no
    /// intervening publish returns nothing.
    pub async fn drain(&self, route: &Route, queue: &str) -> Result<Vec<Message>> {
        let session = Session::open(self.transport()).await?;
        let result = Self::drain_on(session.channel(), route, queue).await;
        session.finish(result).await
    }

    async fn drain_on(channel: &dyn Channel, route: &Route, queue: &str) -> Result<Vec<Message>> {
        declare_binding(channel, route, queue).await?;

        let mut messages = Vec::new();
        while let Some(delivery) = channel.basic_get(queue).await? {
            messages.push(delivery.to_message());
        }

        debug!(queue = %queue, count = messages.len(), "Queue drained");
        Ok(messages)
    }

    // ==================== Subscribe ====================

    /// Start building a subscription on `queue`, bound to `route`
    pub fn subscription(&self, route: &Route, queue: impl Into<String>) -> Subscription<'_> {
        Subscription::new(self, route.clone(), queue.into())
    }

    /// Hand every message arriving on `queue` to `handler` until `cancel` fires
    pub async fn subscribe<'a, H>(
        &'a self,
        route: &Route,
        queue: &str,
        handler: H,
        cancel: &CancellationSignal,
    ) -> Result<SubscriptionReport>
    where
        H: MessageHandler + 'a,
    {
        self.subscription(route, queue).handler(handler).run(cancel).await
    }
}
