//! msgbus Transport - Broker backends for the adapter
//!
//! This crate provides pluggable transports behind one connection/channel
//! interface:
//! - AMQP 0.9.1 over `lapin` (feature `amqp`)
//! - In-memory broker (feature `memory`, for development/testing)

pub mod traits;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use traits::{Channel, Connection, Delivery, DeliveryStream, PublishOutcome, Transport};

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;

#[cfg(feature = "memory")]
pub use memory::MemoryBroker;
