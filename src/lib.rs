//! chatlink - resilient connection manager for line-oriented chat protocols
//!
//! Owns a long-lived TCP or WebSocket connection: opening it with backoff,
//! watching it for silent failure, reconnecting on loss, sending keepalives,
//! and throttling outbound lines so a server-side rate limit is never hit.
//!
//! # Quick Start
//!
//! ```no_run
//! use chatlink::client::{ChatClient, Notification};
//! use chatlink::config::ClientConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_toml_str(r#"
//!     [connection]
//!     url = "tcp://irc.example.net:6667"
//! "#)?;
//! let client = ChatClient::from_config(config)?;
//! let mut events = client.subscribe();
//!
//! if client.open().await {
//!     client.enqueue("PRIVMSG #general :hello");
//!     while let Ok(event) = events.recv().await {
//!         if let Notification::Message { line } = event {
//!             println!("{line}");
//!         }
//!     }
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod reconnect;
pub mod testing;
pub mod throttle;
pub mod transport;

pub use client::{ChatClient, ClientState, Notification};
pub use config::{ClientConfig, ConfigError, Endpoint, OverflowPolicy};
pub use error::{ClientError, ClientResult, TransportError, TransportResult};
pub use reconnect::{BackoffPolicy, ReconnectPolicy, ResetMode};
pub use throttle::{EnqueueOutcome, ThrottleNotice, ThrottleReason, TrafficClass};
pub use transport::{EndpointFactory, Transport, TransportFactory};
