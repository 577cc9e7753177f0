//! Push-mode subscriptions
//!
//! A subscription declares and binds its queue, registers a consumer and
//! hands every delivery to a [`MessageHandler`] before acknowledging it.
//! It runs until its [`CancellationSignal`] fires.
//!
//! ```text
//! Idle -> Declaring -> Bound -> Consuming -> Cancelling -> Closed
//!             |                    |
//!             +-> Closed (error)   +-> Declaring (connection lost, recovery on)
//! ```

use std::fmt;

use futures::StreamExt;
use msgbus_transport::Channel;
use msgbus_types::{Error, Message, Result, Route};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{declare_binding, BrokerAdapter};
use crate::session::Session;

/// Error type a handler may fail with
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives each message of a subscription, one at a time.
///
/// Returning an error aborts the subscription and leaves the current
/// delivery unacknowledged, so the broker delivers it again later.
pub trait MessageHandler: Send {
    fn handle(&mut self, message: Message) -> std::result::Result<(), HandlerError>;
}

impl<F, E> MessageHandler for F
where
    F: FnMut(Message) -> std::result::Result<(), E> + Send,
    E: Into<HandlerError>,
{
    fn handle(&mut self, message: Message) -> std::result::Result<(), HandlerError> {
        self(message).map_err(Into::into)
    }
}

/// Cooperative stop request for a running subscription.
///
/// Clones share the same signal. Cancelling is permanent.
#[derive(Clone)]
pub struct CancellationSignal {
    sender: std::sync::Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: std::sync::Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // the sender lives as long as `self`, so this cannot fail
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Lifecycle of one subscription call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Declaring,
    Bound,
    Consuming,
    Cancelling,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Declaring => "declaring",
            Self::Bound => "bound",
            Self::Consuming => "consuming",
            Self::Cancelling => "cancelling",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Summary of a subscription that closed cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionReport {
    /// Deliveries handled and acknowledged
    pub deliveries: u64,
    /// Times the subscription re-established a lost connection
    pub recoveries: u32,
    /// Every state entered, in order
    pub transitions: Vec<SubscriptionState>,
}

impl SubscriptionReport {
    fn new() -> Self {
        Self {
            deliveries: 0,
            recoveries: 0,
            transitions: vec![SubscriptionState::Idle],
        }
    }

    fn state(&self) -> SubscriptionState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(SubscriptionState::Idle)
    }
}

/// Builder for a subscription; nothing touches the broker until [`run`](Self::run).
pub struct Subscription<'a> {
    adapter: &'a BrokerAdapter,
    route: Route,
    queue: String,
    handler: Option<Box<dyn MessageHandler + 'a>>,
}

impl<'a> Subscription<'a> {
    pub(crate) fn new(adapter: &'a BrokerAdapter, route: Route, queue: String) -> Self {
        Self {
            adapter,
            route,
            queue,
            handler: None,
        }
    }

    /// Set the callback invoked for every message
    pub fn handler(mut self, handler: impl MessageHandler + 'a) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Consume until `cancel` fires.
    ///
    /// Fails with `Error::InvalidArgument` before connecting when no
    /// handler was set.
    pub async fn run(self, cancel: &CancellationSignal) -> Result<SubscriptionReport> {
        let Subscription {
            adapter,
            route,
            queue,
            handler,
        } = self;
        let mut handler = handler.ok_or_else(|| {
            Error::InvalidArgument("a subscription requires a message handler".to_string())
        })?;

        let mut run = Run {
            route: &route,
            queue: &queue,
            report: SubscriptionReport::new(),
            recovering: false,
        };
        let settings = adapter.settings();
        let mut consumed_once = false;

        loop {
            run.enter(SubscriptionState::Declaring);
            let attempt = run
                .attempt(adapter, handler.as_mut(), cancel, &mut consumed_once)
                .await;

            match attempt {
                Ok(()) => break,
                Err(err)
                    if err.is_connectivity() && consumed_once && settings.automatic_recovery =>
                {
                    warn!(
                        exchange = %route.exchange,
                        queue = %queue,
                        error = %err,
                        retry_in_ms = settings.recovery_interval_ms,
                        "Subscription lost its connection, recovering"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            run.enter(SubscriptionState::Cancelling);
                            break;
                        }
                        _ = tokio::time::sleep(settings.recovery_interval()) => {}
                    }
                    run.recovering = true;
                }
                Err(err) => {
                    run.enter(SubscriptionState::Closed);
                    return Err(err);
                }
            }
        }

        run.enter(SubscriptionState::Closed);
        info!(
            exchange = %route.exchange,
            queue = %queue,
            deliveries = run.report.deliveries,
            recoveries = run.report.recoveries,
            "Subscription closed"
        );
        Ok(run.report)
    }
}

/// Mutable bookkeeping of one `run` call
struct Run<'r> {
    route: &'r Route,
    queue: &'r str,
    report: SubscriptionReport,
    /// A connection was lost and consuming has not resumed yet
    recovering: bool,
}

impl Run<'_> {
    fn enter(&mut self, state: SubscriptionState) {
        if self.report.state() == state {
            return;
        }
        debug!(
            queue = %self.queue,
            from = %self.report.state(),
            to = %state,
            "Subscription state changed"
        );
        self.report.transitions.push(state);
    }

    /// One connection's worth of consuming
    async fn attempt(
        &mut self,
        adapter: &BrokerAdapter,
        handler: &mut (dyn MessageHandler + '_),
        cancel: &CancellationSignal,
        consumed_once: &mut bool,
    ) -> Result<()> {
        let session = Session::open(adapter.transport()).await?;
        let result = self
            .consume(session.channel(), handler, cancel, consumed_once)
            .await;
        session.finish(result).await
    }

    async fn consume(
        &mut self,
        channel: &dyn Channel,
        handler: &mut (dyn MessageHandler + '_),
        cancel: &CancellationSignal,
        consumed_once: &mut bool,
    ) -> Result<()> {
        declare_binding(channel, self.route, self.queue).await?;
        self.enter(SubscriptionState::Bound);

        let consumer_tag = format!("msgbus-{}", Uuid::new_v4());
        let mut deliveries = channel.basic_consume(self.queue, &consumer_tag).await?;
        self.enter(SubscriptionState::Consuming);
        *consumed_once = true;
        if self.recovering {
            self.recovering = false;
            self.report.recoveries += 1;
        }
        info!(
            exchange = %self.route.exchange,
            queue = %self.queue,
            routing_key = %self.route.routing_key,
            consumer_tag = %consumer_tag,
            "Subscription consuming"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(Error::Broker(format!(
                        "consumer {consumer_tag} was cancelled by the broker"
                    )))
                }
            };

            if let Err(err) = handler.handle(delivery.to_message()) {
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "Message handler failed, aborting subscription"
                );
                return Err(Error::Handler(err.to_string()));
            }
            channel.basic_ack(delivery.delivery_tag).await?;
            self.report.deliveries += 1;
            debug!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                "Delivery handled"
            );
        }

        self.enter(SubscriptionState::Cancelling);
        channel.basic_cancel(&consumer_tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_closures_are_handlers() {
        let mut seen = Vec::new();
        {
            let mut handler = |message: Message| {
                seen.push(message.body().to_string());
                Ok::<_, Infallible>(())
            };
            handler.handle(Message::new("a")).unwrap();
            handler.handle(Message::new("b")).unwrap();
        }
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_handler_errors_are_boxed() {
        let mut handler = |_: Message| Err::<(), _>("boom".to_string());
        let err = handler.handle(Message::new("x")).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_cancellation_signal_wakes_waiters() {
        let signal = CancellationSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        assert!(!signal.is_cancelled());
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());

        // already cancelled resolves immediately
        signal.cancelled().await;
    }
}
