//! Publishing through broker outages
//!
//! [`BrokerAdapter::publish`] never retries. Callers that must get a fixed
//! number of messages out while the broker comes and goes use
//! [`publish_with_retry`], which retries only connectivity failures.

use std::time::Duration;

use msgbus_types::{Message, Result, Route};
use tracing::{info, warn};

use crate::adapter::BrokerAdapter;

/// How many publishes to achieve and how to pace failed attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Successful publishes required
    pub successes: u32,
    /// Wait after each connectivity failure
    pub delay: Duration,
    /// Give up once this many failures happened in total; `None` retries forever
    pub max_failures: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            successes: 10,
            delay: Duration::from_secs(3),
            max_failures: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(successes: u32) -> Self {
        Self {
            successes,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }
}

/// Outcome of [`publish_with_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub published: u32,
    pub failures: u32,
}

/// Publish `message` until `policy.successes` publishes went through.
///
/// Connectivity failures are logged and retried after `policy.delay`; any
/// other error is returned at once. Reaching `policy.max_failures` returns
/// the last connectivity error.
pub async fn publish_with_retry(
    adapter: &BrokerAdapter,
    message: &Message,
    route: &Route,
    policy: &RetryPolicy,
) -> Result<RetryReport> {
    let mut report = RetryReport {
        published: 0,
        failures: 0,
    };

    while report.published < policy.successes {
        match adapter.publish(message, route).await {
            Ok(()) => report.published += 1,
            Err(err) if err.is_connectivity() => {
                report.failures += 1;
                if policy.max_failures.is_some_and(|max| report.failures >= max) {
                    return Err(err);
                }
                warn!(
                    exchange = %route.exchange,
                    attempt = report.published + report.failures,
                    error = %err,
                    "Publish failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    info!(
        exchange = %route.exchange,
        published = report.published,
        failures = report.failures,
        "Publish with retry finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use msgbus_transport::{Connection, MemoryBroker, Transport};
    use msgbus_types::{ConnectionSettings, Error, ExchangeKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Refuses every connection and counts the attempts
    #[derive(Clone, Default)]
    struct Unreachable {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Transport for Unreachable {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Connection("connection refused".to_string()))
        }
    }

    fn create_test_adapter(broker: &MemoryBroker) -> BrokerAdapter {
        BrokerAdapter::with_transport(ConnectionSettings::default(), broker.clone())
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.successes, 10);
        assert_eq!(policy.delay, Duration::from_secs(3));
        assert_eq!(policy.max_failures, None);
    }

    #[tokio::test]
    async fn test_publishes_exactly_n_across_outage() {
        let broker = MemoryBroker::new();
        let adapter = create_test_adapter(&broker);
        let route = Route::new("message.shared");
        adapter.drain(&route, "message-shared-queue").await.unwrap();

        broker.set_online(false);
        let reconnect = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                broker.set_online(true);
            })
        };

        let policy = RetryPolicy::new(10).with_delay(Duration::from_millis(5));
        let report = publish_with_retry(&adapter, &Message::new("test message"), &route, &policy)
            .await
            .unwrap();
        reconnect.await.unwrap();

        assert_eq!(report.published, 10);
        assert!(report.failures >= 1);
        assert_eq!(broker.queue_depth("message-shared-queue"), Some(10));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_failures() {
        let transport = Unreachable::default();
        let adapter = BrokerAdapter::with_transport(ConnectionSettings::default(), transport.clone());

        let policy = RetryPolicy::new(1)
            .with_delay(Duration::ZERO)
            .with_max_failures(2);
        let err = publish_with_retry(&adapter, &Message::new("x"), &Route::new("ex"), &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_connectivity_errors_are_not_retried() {
        let broker = MemoryBroker::new();
        let adapter = create_test_adapter(&broker);
        adapter
            .publish(&Message::new("x"), &Route::new("ex"))
            .await
            .unwrap();

        let conflicting = Route::new("ex").with_kind(ExchangeKind::Topic);
        let err = publish_with_retry(
            &adapter,
            &Message::new("x"),
            &conflicting,
            &RetryPolicy::new(3).with_delay(Duration::ZERO),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::DeclarationConflict { .. }));
        assert!(!err.is_connectivity());
    }
}
