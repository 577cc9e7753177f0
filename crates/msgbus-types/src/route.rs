//! Exchange routing types
//!
//! A [`Route`] names an exchange and the routing key, exchange kind and
//! durability every operation declares it with.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Exchange type.
///
/// The broker owns validation; anything not listed here passes through as
/// [`ExchangeKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExchangeKind {
    #[default]
    Fanout,
    Direct,
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Headers => "headers",
            Self::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "fanout" => Self::Fanout,
            "direct" => Self::Direct,
            "topic" => Self::Topic,
            "headers" => Self::Headers,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for ExchangeKind {
    fn from(kind: String) -> Self {
        Self::from(kind.as_str())
    }
}

impl From<ExchangeKind> for String {
    fn from(kind: ExchangeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for ExchangeKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

/// Where a message goes: exchange, routing key, and how the exchange is declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub exchange: String,

    #[serde(default)]
    pub routing_key: String,

    #[serde(default)]
    pub kind: ExchangeKind,

    /// Applies to the exchange and, for drain/subscribe, the queue
    #[serde(default)]
    pub durable: bool,
}

impl Route {
    /// Transient fanout exchange with an empty routing key
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: String::new(),
            kind: ExchangeKind::Fanout,
            durable: false,
        }
    }

    /// Transient direct exchange bound with `routing_key`
    pub fn direct(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self::new(exchange)
            .with_kind(ExchangeKind::Direct)
            .with_routing_key(routing_key)
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<ExchangeKind>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_defaults() {
        let route = Route::new("message.shared");
        assert_eq!(route.routing_key, "");
        assert_eq!(route.kind, ExchangeKind::Fanout);
        assert!(!route.durable);
    }

    #[test]
    fn test_kind_passes_unknown_types_through() {
        assert_eq!(ExchangeKind::from("direct"), ExchangeKind::Direct);
        let custom = ExchangeKind::from("x-consistent-hash");
        assert_eq!(custom, ExchangeKind::Custom("x-consistent-hash".into()));
        assert_eq!(custom.to_string(), "x-consistent-hash");
    }

    #[test]
    fn test_route_deserializes_with_defaults() {
        let route: Route =
            serde_json::from_str(r#"{"exchange":"message.direct","kind":"direct"}"#).unwrap();
        assert_eq!(route.kind, ExchangeKind::Direct);
        assert_eq!(route.routing_key, "");
        assert!(!route.durable);
    }
}
