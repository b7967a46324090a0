//! Connection client: lifecycle core, supervision and notifications
//!
//! [`ChatClient`] owns the connection. Once connected, the
//! [`ServiceOrchestrator`] runs three background activities against it: the
//! listener, the [`Watchdog`] and the outbound rate limiter. The watchdog and
//! listener reach back into the client only through [`SupervisedClient`].

pub mod epoch;
pub mod events;
pub mod lifecycle;
pub mod orchestrator;
pub mod state;
pub mod watchdog;

use async_trait::async_trait;

pub use epoch::{ConnectionEpoch, EpochCell};
pub use events::{EventBus, Notification};
pub use lifecycle::ChatClient;
pub use orchestrator::ServiceOrchestrator;
pub use state::ClientState;
pub use watchdog::Watchdog;

/// The client surface that background loops are allowed to drive
#[async_trait]
pub trait SupervisedClient: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send one line; failures are reported as SendFailed, never raised
    async fn send(&self, line: &str) -> bool;

    /// Tear down the current epoch and reopen, keeping the watchdog alive
    async fn reconnect_internal(&self) -> bool;

    /// Full close, including the watchdog
    async fn close(&self);

    /// The listener saw the connection of `generation` end
    fn connection_lost(&self, generation: u64);

    fn notify(&self, notification: Notification);
}
