//! Transport layer for line-oriented chat connections
//!
//! The lifecycle core depends only on the [`Transport`] capability trait.
//! A [`TransportFactory`] hands out one fresh transport per connection attempt;
//! concrete adapters exist for raw TCP and WebSocket endpoints.

use crate::config::{ConfigError, Endpoint};
use crate::error::TransportResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod tcp;
pub mod websocket;

pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

/// Longest inbound line accepted before the read fails
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// One physical connection
///
/// Methods take `&self` so the listener loop can read while the lifecycle
/// core writes; implementations guard each half internally. Callers must not
/// issue concurrent `send_line` calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection, giving up early if `cancel` fires
    async fn connect(&self, cancel: &CancellationToken) -> TransportResult<()>;

    /// Write one line; the adapter adds the line terminator
    async fn send_line(&self, line: &str) -> TransportResult<()>;

    /// Read the next inbound line, `Ok(None)` once the peer has closed
    async fn read_line(&self) -> TransportResult<Option<String>>;

    /// Close the connection and release the instance
    async fn close(&self) -> TransportResult<()>;

    /// Whether the connection is currently believed usable
    fn is_alive(&self) -> bool;
}

/// Creates a fresh transport for every connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transport>;
}

/// Factory selecting TCP or WebSocket from a configured endpoint
#[derive(Debug, Clone)]
pub struct EndpointFactory {
    endpoint: Endpoint,
}

impl EndpointFactory {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Build a factory from a validated configuration
    pub fn from_config(config: &crate::config::ClientConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.endpoint()?))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl TransportFactory for EndpointFactory {
    fn create(&self) -> Arc<dyn Transport> {
        match &self.endpoint {
            Endpoint::Tcp { addr } => Arc::new(TcpTransport::new(addr.clone())),
            Endpoint::WebSocket { url } => Arc::new(WebSocketTransport::new(url.clone())),
        }
    }
}
