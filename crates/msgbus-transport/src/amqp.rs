//! AMQP 0.9.1 backend over `lapin`
//!
//! Every trait call maps onto one protocol method. Publishing channels
//! switch to confirm mode so unroutable (returned) messages can be
//! reported.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, ConnectionProperties, ConnectionStatus};
use msgbus_types::{ConnectionSettings, Error, ExchangeKind, MessageProperties, Result};
use tracing::{debug, info};

use crate::traits::{Channel, Connection, Delivery, DeliveryStream, PublishOutcome, Transport};

const REPLY_SUCCESS: u16 = 200;

/// Transport opening real broker connections
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    settings: ConnectionSettings,
}

impl AmqpTransport {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

/// Connection URI with credentials, vhost and heartbeat taken from settings
fn amqp_uri(settings: &ConnectionSettings) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.username.clone(),
                password: settings.password.clone(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: settings.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(settings.heartbeat_secs),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

fn map_error(err: lapin::Error) -> Error {
    match &err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => Error::Connection(err.to_string()),
        lapin::Error::ProtocolError(amqp) if matches!(amqp.kind(), AMQPErrorKind::Hard(_)) => {
            Error::Connection(err.to_string())
        }
        _ => Error::Broker(err.to_string()),
    }
}

/// Channel failures caused by the connection going away are connectivity errors
fn map_channel_error(err: lapin::Error, connection_alive: bool) -> Error {
    match &err {
        lapin::Error::InvalidChannelState(_) if !connection_alive => {
            Error::Connection(err.to_string())
        }
        _ => map_error(err),
    }
}

fn short(value: &str) -> ShortString {
    ShortString::from(value.to_string())
}

fn to_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(message_id) = &properties.message_id {
        props = props.with_message_id(short(message_id));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        props = props.with_correlation_id(short(correlation_id));
    }
    if let Some(reply_to) = &properties.reply_to {
        props = props.with_reply_to(short(reply_to));
    }
    props
}

fn to_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.as_str().to_string());
    Delivery {
        delivery_tag: delivery.delivery_tag,
        body: Bytes::copy_from_slice(&delivery.data),
        properties: MessageProperties {
            message_id: text(delivery.properties.message_id()),
            correlation_id: text(delivery.properties.correlation_id()),
            reply_to: text(delivery.properties.reply_to()),
        },
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let connection =
            lapin::Connection::connect_uri(amqp_uri(&self.settings), ConnectionProperties::default())
                .await
                .map_err(|err| {
                    Error::Connection(format!("{}: {err}", self.settings.endpoint()))
                })?;

        info!(
            endpoint = %self.settings.endpoint(),
            heartbeat_secs = self.settings.heartbeat_secs,
            "Connected to broker"
        );
        Ok(Box::new(AmqpConnection { connection }))
    }
}

pub struct AmqpConnection {
    connection: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Box<dyn Channel>> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        debug!(channel = channel.id(), "Channel opened");
        Ok(Box::new(AmqpChannel {
            channel,
            connection: self.connection.status().clone(),
            confirms: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}

pub struct AmqpChannel {
    channel: lapin::Channel,
    connection: ConnectionStatus,
    /// Confirm mode is enabled lazily on first publish
    confirms: AtomicBool,
}

impl AmqpChannel {
    fn error(&self, err: lapin::Error) -> Error {
        map_channel_error(err, self.connection.connected())
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn exchange_declare(&self, name: &str, kind: &ExchangeKind, durable: bool) -> Result<()> {
        let options = ExchangeDeclareOptions {
            durable,
            auto_delete: false,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, lapin_kind(kind), options, FieldTable::default())
            .await
            .map_err(|err| {
                if is_precondition_failed(&err) {
                    Error::exchange_conflict(name, err.to_string())
                } else {
                    self.error(err)
                }
            })
    }

    async fn queue_declare(&self, name: &str, durable: bool) -> Result<()> {
        let options = QueueDeclareOptions {
            durable,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|err| {
                if is_precondition_failed(&err) {
                    Error::queue_conflict(name, err.to_string())
                } else {
                    self.error(err)
                }
            })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.error(err))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishOutcome> {
        if !self.confirms.load(Ordering::Acquire) {
            self.channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| self.error(err))?;
            self.confirms.store(true, Ordering::Release);
        }

        let options = BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        };
        let confirmation = self
            .channel
            .basic_publish(exchange, routing_key, options, body, to_properties(properties))
            .await
            .map_err(|err| self.error(err))?
            .await
            .map_err(|err| self.error(err))?;

        match confirmation {
            Confirmation::Ack(Some(_)) => Ok(PublishOutcome::Returned),
            Confirmation::Nack(_) => Err(Error::Broker(format!(
                "publish to '{exchange}' was negatively acknowledged"
            ))),
            _ => Ok(PublishOutcome::Routed),
        }
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await
            .map_err(|err| self.error(err))?;
        Ok(message.map(|message| to_delivery(&message.delivery)))
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.error(err))?;

        let connection = self.connection.clone();
        Ok(consumer
            .map(move |item| {
                item.map(|delivery| to_delivery(&delivery))
                    .map_err(|err| map_channel_error(err, connection.connected()))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| self.error(err))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| self.error(err))
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| self.error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_carries_settings() {
        let settings = ConnectionSettings::new("rabbit.internal");
        let uri = amqp_uri(&settings);

        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(30));
    }

    #[test]
    fn test_kind_mapping_passes_custom_through() {
        assert!(matches!(
            lapin_kind(&ExchangeKind::Custom("x-delayed-message".into())),
            lapin::ExchangeKind::Custom(kind) if kind == "x-delayed-message"
        ));
        assert!(matches!(
            lapin_kind(&ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        ));
    }

    #[test]
    fn test_properties_keep_empty_strings() {
        let props = to_properties(&MessageProperties {
            message_id: None,
            correlation_id: Some(String::new()),
            reply_to: Some(String::new()),
        });

        assert_eq!(props.correlation_id().as_ref().map(|v| v.as_str()), Some(""));
        assert_eq!(props.reply_to().as_ref().map(|v| v.as_str()), Some(""));
        assert!(props.message_id().is_none());
    }

    #[test]
    fn test_connection_state_errors_are_connectivity() {
        let err = map_error(lapin::Error::InvalidConnectionState(
            lapin::ConnectionState::Closed,
        ));
        assert!(err.is_connectivity());

        // dead peer detected by the heartbeat
        assert!(map_error(lapin::Error::MissingHeartbeatError).is_connectivity());
    }

    #[test]
    fn test_closed_channel_is_connectivity_only_when_connection_is_gone() {
        let closed = || lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);

        assert!(map_channel_error(closed(), false).is_connectivity());
        assert!(matches!(map_channel_error(closed(), true), Error::Broker(_)));
        assert!(map_channel_error(lapin::Error::MissingHeartbeatError, true).is_connectivity());
    }
}
