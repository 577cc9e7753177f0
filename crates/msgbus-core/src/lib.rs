//! msgbus Core - Broker adapter for fanout and direct messaging
//!
//! This crate contains the adapter applications talk to:
//! - BrokerAdapter: publish, drain and subscribe
//! - Subscription: push-mode consumption with cancellation and recovery
//! - publish_with_retry: publishing through broker outages

pub mod adapter;
pub mod retry;
mod session;
pub mod subscription;

// Re-exports
pub use adapter::BrokerAdapter;
pub use retry::{publish_with_retry, RetryPolicy, RetryReport};
pub use subscription::{
    CancellationSignal, HandlerError, MessageHandler, Subscription, SubscriptionReport,
    SubscriptionState,
};

pub use msgbus_transport::MemoryBroker;
pub use msgbus_types::{ConnectionSettings, Error, ExchangeKind, Message, Result, Route};
