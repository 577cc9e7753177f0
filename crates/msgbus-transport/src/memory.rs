//! In-memory broker backend
//!
//! An in-process model of an AMQP broker for development and testing:
//! fanout/direct/topic exchanges, queues, bindings, `basic.get`, push
//! consumers with manual acknowledgment and per-channel delivery tags.
//! All data is lost when the last handle is dropped.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use msgbus_types::{Error, ExchangeKind, MessageProperties, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::traits::{Channel, Connection, Delivery, DeliveryStream, PublishOutcome, Transport};

/// A message sitting in a queue or awaiting acknowledgment
#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeData {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

impl ExchangeData {
    /// Queues a message published with `routing_key` goes to
    fn route(&self, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                _ => false,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueData {
    durable: bool,
    /// Messages ready for delivery
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    /// Round robin cursor into `consumers`
    next_consumer: usize,
}

impl QueueData {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct ChannelData {
    connection: u64,
    next_tag: u64,
    /// Delivered but not yet acknowledged, by delivery tag
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

impl ChannelData {
    fn next_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeData>,
    queues: HashMap<String, QueueData>,
    channels: HashMap<u64, ChannelData>,
}

impl BrokerState {
    /// Push ready messages of `queue` to its consumers
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            let Some(message) = queue.messages.pop_front() else {
                break;
            };

            let channel_id = queue.consumers[index].channel;
            let Some(channel) = self.channels.get_mut(&channel_id) else {
                queue.consumers.remove(index);
                queue.messages.push_front(message);
                continue;
            };

            let tag = channel.next_tag();
            let delivery = Delivery {
                delivery_tag: tag,
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };

            if queue.consumers[index].sender.send(Ok(delivery)).is_err() {
                // receiver dropped without a cancel
                queue.consumers.remove(index);
                queue.messages.push_front(message);
                continue;
            }

            channel.unacked.insert(tag, (queue_name.to_string(), message));
            queue.next_consumer = index + 1;
        }
    }

    /// Tear down a channel: cancel its consumers and requeue unacked messages.
    ///
    /// When `lost` is set, consumer streams receive a connection error first.
    fn release_channel(&mut self, channel_id: u64, lost: bool) -> bool {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return false;
        };

        let mut touched = HashSet::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                if consumer.channel != channel_id {
                    return true;
                }
                if lost {
                    let _ = consumer
                        .sender
                        .send(Err(Error::Connection("connection lost".to_string())));
                }
                false
            });
            if queue.consumers.len() != before {
                touched.insert(name.clone());
            }
        }

        // newest first so the original order is restored at the front
        for (_, (queue_name, mut message)) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.insert(queue_name);
            }
        }

        for queue_name in touched {
            self.dispatch(&queue_name);
        }
        true
    }

    fn channels_of(&self, connection: u64) -> Vec<u64> {
        self.channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    /// Live connections and their open flags
    connections: DashMap<u64, Arc<AtomicBool>>,
    ids: AtomicU64,
    online: AtomicBool,
}

impl BrokerInner {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn close_connection(&self, id: u64, lost: bool) -> bool {
        let Some((_, open)) = self.connections.remove(&id) else {
            return false;
        };
        open.store(false, Ordering::SeqCst);

        let mut state = self.state.lock();
        for channel in state.channels_of(id) {
            state.release_channel(channel, lost);
        }
        true
    }
}

/// In-memory broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create a new, empty, online broker
    pub fn new() -> Self {
        info!("Initializing in-memory broker");
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                connections: DashMap::new(),
                ids: AtomicU64::new(0),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Refuse (`false`) or accept (`true`) new connections
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        info!(online, "In-memory broker availability changed");
    }

    /// Drop every live connection as if the network failed.
    ///
    /// Consumers observe a connection error; unacknowledged messages are
    /// requeued. Returns the number of connections dropped.
    pub fn sever_connections(&self) -> usize {
        let ids: Vec<u64> = self.inner.connections.iter().map(|entry| *entry.key()).collect();
        let severed = ids
            .into_iter()
            .filter(|id| self.inner.close_connection(*id, true))
            .count();
        info!(count = severed, "Severed in-memory connections");
        severed
    }

    pub fn open_connections(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    /// Ready messages in a queue, `None` if it was never declared
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
    }

    /// Deliveries awaiting acknowledgment across all channels
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(Error::Connection(
                "connection refused: broker offline".to_string(),
            ));
        }

        let id = self.inner.next_id();
        let open = Arc::new(AtomicBool::new(true));
        self.inner.connections.insert(id, Arc::clone(&open));
        debug!(connection = id, "Connection opened");

        Ok(Box::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            id,
            open,
        }))
    }
}

/// Connection to a [`MemoryBroker`]; closed on drop
pub struct MemoryConnection {
    broker: Arc<BrokerInner>,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn Channel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection is closed".to_string()));
        }

        let id = self.broker.next_id();
        self.broker.state.lock().channels.insert(
            id,
            ChannelData {
                connection: self.id,
                next_tag: 1,
                unacked: BTreeMap::new(),
            },
        );
        debug!(connection = self.id, channel = id, "Channel opened");

        Ok(Box::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            id,
            connection_open: Arc::clone(&self.open),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.broker.close_connection(self.id, false) {
            debug!(connection = self.id, "Connection closed");
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.close_connection(self.id, false);
    }
}

/// Channel on a [`MemoryConnection`]; closed on drop
pub struct MemoryChannel {
    broker: Arc<BrokerInner>,
    id: u64,
    connection_open: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Lock broker state after checking this channel is still usable
    fn state(&self) -> Result<parking_lot::MutexGuard<'_, BrokerState>> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection is closed".to_string()));
        }
        let state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(Error::Broker(format!("channel {} is closed", self.id)));
        }
        Ok(state)
    }

    /// Channel-level exception: the broker closes the channel
    fn fail(&self, state: &mut BrokerState, error: Error) -> Error {
        state.release_channel(self.id, false);
        debug!(channel = self.id, error = %error, "Channel closed by broker");
        error
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn exchange_declare(&self, name: &str, kind: &ExchangeKind, durable: bool) -> Result<()> {
        let mut state = self.state()?;

        if name.is_empty() {
            let err = Error::Broker("access refused: the default exchange cannot be declared".into());
            return Err(self.fail(&mut state, err));
        }
        if !matches!(
            kind,
            ExchangeKind::Fanout | ExchangeKind::Direct | ExchangeKind::Topic
        ) {
            let err = Error::Broker(format!("exchange type '{kind}' is not supported"));
            return Err(self.fail(&mut state, err));
        }

        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != *kind {
                let reason = format!("type is '{}', requested '{}'", existing.kind, kind);
                return Err(self.fail(&mut state, Error::exchange_conflict(name, reason)));
            }
            if existing.durable != durable {
                let reason = format!("durable is {}, requested {}", existing.durable, durable);
                return Err(self.fail(&mut state, Error::exchange_conflict(name, reason)));
            }
            return Ok(());
        }

        state.exchanges.insert(
            name.to_string(),
            ExchangeData {
                kind: kind.clone(),
                durable,
                bindings: Vec::new(),
            },
        );
        info!(exchange = %name, kind = %kind, durable, "Exchange declared");
        Ok(())
    }

    async fn queue_declare(&self, name: &str, durable: bool) -> Result<()> {
        let mut state = self.state()?;

        if name.is_empty() {
            let err = Error::Broker("queue name must not be empty".into());
            return Err(self.fail(&mut state, err));
        }

        if let Some(existing) = state.queues.get(name) {
            if existing.durable != durable {
                let reason = format!("durable is {}, requested {}", existing.durable, durable);
                return Err(self.fail(&mut state, Error::queue_conflict(name, reason)));
            }
            return Ok(());
        }

        state.queues.insert(name.to_string(), QueueData::new(durable));
        info!(queue = %name, durable, "Queue declared");
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state()?;

        if !state.queues.contains_key(queue) {
            let err = Error::Broker(format!("not found: queue '{queue}'"));
            return Err(self.fail(&mut state, err));
        }
        let Some(data) = state.exchanges.get_mut(exchange) else {
            let err = Error::Broker(format!("not found: exchange '{exchange}'"));
            return Err(self.fail(&mut state, err));
        };

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !data.bindings.contains(&binding) {
            data.bindings.push(binding);
            debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Queue bound");
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<PublishOutcome> {
        let mut state = self.state()?;

        let Some(data) = state.exchanges.get(exchange) else {
            let err = Error::Broker(format!("not found: exchange '{exchange}'"));
            return Err(self.fail(&mut state, err));
        };
        let targets = data.route(routing_key);

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message returned as unroutable");
            return Ok(PublishOutcome::Returned);
        }

        let message = StoredMessage {
            body: Bytes::copy_from_slice(body),
            properties: properties.clone(),
            redelivered: false,
        };
        for queue_name in &targets {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.messages.push_back(message.clone());
            }
            state.dispatch(queue_name);
        }

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            queues = targets.len(),
            "Message routed"
        );
        Ok(PublishOutcome::Routed)
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.state()?;

        let Some(data) = state.queues.get_mut(queue) else {
            let err = Error::Broker(format!("not found: queue '{queue}'"));
            return Err(self.fail(&mut state, err));
        };
        let Some(message) = data.messages.pop_front() else {
            return Ok(None);
        };

        let tag = match state.channels.get_mut(&self.id) {
            Some(channel) => channel.next_tag(),
            None => return Err(Error::Broker(format!("channel {} is closed", self.id))),
        };

        Ok(Some(Delivery {
            delivery_tag: tag,
            body: message.body,
            properties: message.properties,
            redelivered: message.redelivered,
        }))
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.state()?;

        let channel_id = self.id;
        let Some(data) = state.queues.get_mut(queue) else {
            let err = Error::Broker(format!("not found: queue '{queue}'"));
            return Err(self.fail(&mut state, err));
        };
        if data
            .consumers
            .iter()
            .any(|consumer| consumer.channel == channel_id && consumer.tag == consumer_tag)
        {
            let err = Error::Broker(format!("consumer tag '{consumer_tag}' is already in use"));
            return Err(self.fail(&mut state, err));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        data.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_string(),
            channel: channel_id,
            sender,
        });
        info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");
        state.dispatch(queue);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state()?;

        let acked = state
            .channels
            .get_mut(&self.id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        match acked {
            Some((queue, _)) => {
                debug!(queue = %queue, delivery_tag, "Delivery acknowledged");
                Ok(())
            }
            None => {
                let err = Error::Broker(format!("unknown delivery tag {delivery_tag}"));
                Err(self.fail(&mut state, err))
            }
        }
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.state()?;

        let channel_id = self.id;
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|consumer| !(consumer.channel == channel_id && consumer.tag == consumer_tag));
            if queue.consumers.len() != before {
                info!(queue = %name, consumer_tag = %consumer_tag, "Consumer cancelled");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.broker.state.lock().release_channel(self.id, false) {
            debug!(channel = self.id, "Channel closed");
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.broker.state.lock().release_channel(self.id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> (Box<dyn Connection>, Box<dyn Channel>) {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        (connection, channel)
    }

    async fn declare_bound(channel: &dyn Channel, exchange: &str, kind: ExchangeKind, queue: &str, key: &str) {
        channel.exchange_declare(exchange, &kind, false).await.unwrap();
        channel.queue_declare(queue, false).await.unwrap();
        channel.queue_bind(queue, exchange, key).await.unwrap();
    }

    fn props() -> MessageProperties {
        MessageProperties::default()
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("message.*", "message.hr"));
        assert!(!topic_matches("message.*", "message.hr.eu"));
        assert!(topic_matches("message.#", "message.hr.eu"));
        assert!(topic_matches("message.#", "message"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.hr.#", "message.hr"));
        assert!(!topic_matches("message.hr", "message.marketing"));
    }

    #[tokio::test]
    async fn test_fanout_publish_and_get() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        declare_bound(channel.as_ref(), "shared", ExchangeKind::Fanout, "q", "").await;

        let outcome = channel
            .basic_publish("shared", "ignored", b"Hello!", &props())
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Routed);

        let delivery = channel.basic_get("q").await.unwrap().unwrap();
        assert_eq!(&delivery.body[..], b"Hello!");
        assert!(channel.basic_get("q").await.unwrap().is_none());
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_direct_routing_filters_by_key() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        declare_bound(channel.as_ref(), "direct", ExchangeKind::Direct, "hr", "message.hr").await;

        let outcome = channel
            .basic_publish("direct", "message.marketing", b"nope", &props())
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Returned);
        assert_eq!(broker.queue_depth("hr"), Some(0));

        channel
            .basic_publish("direct", "message.hr", b"yes", &props())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("hr"), Some(1));
    }

    #[tokio::test]
    async fn test_conflicting_exchange_closes_channel() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .exchange_declare("x", &ExchangeKind::Fanout, false)
            .await
            .unwrap();
        channel
            .exchange_declare("x", &ExchangeKind::Fanout, false)
            .await
            .unwrap();

        let err = channel
            .exchange_declare("x", &ExchangeKind::Direct, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeclarationConflict { .. }));

        let err = channel.queue_declare("q", false).await.unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_queue_durability_conflict() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel.queue_declare("q", true).await.unwrap();

        let (_conn2, channel2) = open(&broker).await;
        let err = channel2.queue_declare("q", false).await.unwrap_err();
        assert!(matches!(err, Error::DeclarationConflict { entity: "queue", .. }));
    }

    #[tokio::test]
    async fn test_unsupported_exchange_kind() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        let err = channel
            .exchange_declare("h", &ExchangeKind::Headers, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
    }

    #[tokio::test]
    async fn test_consumer_receives_and_acks() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        declare_bound(channel.as_ref(), "shared", ExchangeKind::Fanout, "q", "").await;

        let mut stream = channel.basic_consume("q", "c1").await.unwrap();
        channel
            .basic_publish("shared", "", b"one", &props())
            .await
            .unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(&delivery.body[..], b"one");
        assert_eq!(broker.unacked_count(), 1);

        channel.basic_ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);

        channel.basic_cancel("c1").await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        declare_bound(channel.as_ref(), "shared", ExchangeKind::Fanout, "q", "").await;

        for body in [b"a".as_slice(), b"b".as_slice()] {
            channel.basic_publish("shared", "", body, &props()).await.unwrap();
        }
        let mut stream = channel.basic_consume("q", "c1").await.unwrap();
        let _first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();

        channel.close().await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(2));

        let (_conn2, channel2) = open(&broker).await;
        let first = channel2.basic_get("q").await.unwrap().unwrap();
        assert_eq!(&first.body[..], b"a");
        assert!(first.redelivered);
    }

    #[tokio::test]
    async fn test_sever_ends_streams_with_connection_error() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        declare_bound(channel.as_ref(), "shared", ExchangeKind::Fanout, "q", "").await;
        let mut stream = channel.basic_consume("q", "c1").await.unwrap();

        assert_eq!(broker.sever_connections(), 1);

        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(Error::Connection(_))));
        assert!(stream.next().await.is_none());
        assert!(matches!(
            channel.basic_get("q").await,
            Err(Error::Connection(_))
        ));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_offline_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_online(false);
        assert!(matches!(broker.connect().await, Err(Error::Connection(_))));

        broker.set_online(true);
        assert!(broker.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_resources() {
        let broker = MemoryBroker::new();
        {
            let (_conn, _channel) = open(&broker).await;
            assert_eq!(broker.open_connections(), 1);
            assert_eq!(broker.open_channels(), 1);
        }
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_channels(), 0);
    }
}
