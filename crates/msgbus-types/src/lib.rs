//! msgbus Types - Core domain types for the broker adapter
//!
//! This crate contains all shared types used across msgbus components.

pub mod error;
pub mod message;
pub mod route;
pub mod settings;

// Re-export commonly used types
pub use error::{Error, Result};
pub use message::{Message, MessageProperties};
pub use route::{ExchangeKind, Route};
pub use settings::ConnectionSettings;
