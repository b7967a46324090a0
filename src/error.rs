//! Error types for the chatlink connection manager
//!
//! Transport adapters report [`TransportError`]; everything surfaced to callers
//! and subscribers is a [`ClientError`].

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a transport adapter
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Send failed: {0}")]
    SendFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Read failed: {0}")]
    ReadFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Close failed: {0}")]
    CloseFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Transport is not connected")]
    NotConnected,
}

impl TransportError {
    /// Wrap any displayable failure as a connect error
    pub fn connect<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ConnectFailed(Box::new(error))
    }

    /// Wrap any displayable failure as a send error
    pub fn send<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::SendFailed(Box::new(error))
    }

    /// Wrap any displayable failure as a read error
    pub fn read<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ReadFailed(Box::new(error))
    }
}

/// Main error type for client operations and notifications
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Client is not connected")]
    NotConnected,

    #[error("Reconnection attempts exhausted after {attempts} attempt(s)")]
    AttemptsExhausted { attempts: u32 },

    #[error("Watchdog is already running")]
    WatchdogAlreadyRunning,

    #[error("Watchdog fault: {message}")]
    WatchdogFault { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Create a watchdog fault error
    pub fn watchdog_fault<S: Into<String>>(message: S) -> Self {
        Self::WatchdogFault {
            message: message.into(),
        }
    }

    /// Whether this error is fallout from an intentional shutdown
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ClientError::Transport(TransportError::Cancelled))
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
