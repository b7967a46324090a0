//! Supervision of the per-connection background activities

use super::epoch::ConnectionEpoch;
use super::events::Notification;
use super::watchdog::Watchdog;
use super::SupervisedClient;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::observability::metrics;
use crate::throttle::{OutboundSink, RateLimiter};
use crate::transport::Transport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LISTENER_STOP_GRACE: Duration = Duration::from_millis(500);

struct ListenerRun {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts and stops the listener, watchdog and rate limiter as one unit
pub struct ServiceOrchestrator {
    watchdog: Watchdog,
    limiter: RateLimiter,
    listener: Mutex<Option<ListenerRun>>,
}

impl ServiceOrchestrator {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            watchdog: Watchdog::new(config.watchdog.clone()),
            limiter: RateLimiter::new(&config.throttle),
            listener: Mutex::new(None),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<ListenerRun>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_listening(&self) -> bool {
        self.listener_slot().is_some()
    }

    /// Whether any supervised activity is running
    pub fn is_active(&self) -> bool {
        self.is_listening() || self.watchdog.is_running() || self.limiter.is_running()
    }

    /// Bring up supervision for a freshly connected epoch
    pub fn start(
        &self,
        client: Weak<dyn SupervisedClient>,
        sink: Weak<dyn OutboundSink>,
        transport: Arc<dyn Transport>,
        epoch: &ConnectionEpoch,
    ) {
        // A watchdog-driven reconnect lands here with the watchdog still up
        if !self.watchdog.is_running() {
            if let Err(e) = self.watchdog.start(client.clone()) {
                warn!(error = %e, "Watchdog did not start");
            }
        }
        self.limiter.start(sink);
        self.start_listener(client, transport, epoch);
        info!(generation = epoch.generation(), "Supervision started");
    }

    fn start_listener(
        &self,
        client: Weak<dyn SupervisedClient>,
        transport: Arc<dyn Transport>,
        epoch: &ConnectionEpoch,
    ) {
        let token = epoch.token().child_token();
        let generation = epoch.generation();
        let handle = tokio::spawn(listen(client, transport, token.clone(), generation));

        let previous = self.listener_slot().replace(ListenerRun {
            generation,
            token,
            handle,
        });
        if let Some(previous) = previous {
            warn!(
                generation = previous.generation,
                "Replacing listener that was never stopped"
            );
            previous.token.cancel();
        }
    }

    async fn stop_listener(&self) {
        let run = self.listener_slot().take();
        let Some(mut run) = run else {
            return;
        };
        run.token.cancel();
        if tokio::time::timeout(LISTENER_STOP_GRACE, &mut run.handle)
            .await
            .is_err()
        {
            warn!(generation = run.generation, "Listener did not stop in time, aborting");
            run.handle.abort();
        }
    }

    /// Stop everything except the watchdog
    ///
    /// Used by the watchdog's own reconnect path, which must keep running.
    pub async fn stop_for_reconnect(&self) {
        self.stop_listener().await;
        self.limiter.stop().await;
        debug!("Supervision paused for reconnect");
    }

    /// Stop every supervised activity, watchdog included
    pub async fn stop(&self) {
        self.stop_for_reconnect().await;
        self.watchdog.stop().await;
        debug!("Supervision stopped");
    }

    /// Signal every activity to stop without waiting
    pub fn cancel_all(&self) {
        if let Some(run) = self.listener_slot().take() {
            run.token.cancel();
        }
        self.limiter.cancel();
        self.watchdog.cancel();
    }
}

impl std::fmt::Debug for ServiceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceOrchestrator")
            .field("watchdog", &self.watchdog)
            .field("limiter", &self.limiter)
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Turn transport input into notifications until the epoch ends
async fn listen(
    client: Weak<dyn SupervisedClient>,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
    generation: u64,
) {
    debug!(generation, "Listener started");
    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            read = transport.read_line() => read,
        };

        let Some(client) = client.upgrade() else { break };

        match read {
            Ok(Some(line)) => {
                // Lines that raced with a close are dropped
                if token.is_cancelled() {
                    break;
                }
                metrics().message_received();
                client.notify(Notification::Message { line });
            }
            Ok(None) => {
                // Liveness is now false; the watchdog takes it from here
                info!(generation, "Remote closed the connection");
                if !token.is_cancelled() {
                    client.connection_lost(generation);
                }
                break;
            }
            Err(e) => {
                let error = ClientError::from(e);
                if token.is_cancelled() || error.is_cancellation() {
                    debug!(generation, error = %error, "Read ended by shutdown");
                } else {
                    warn!(generation, error = %error, "Read failed");
                    client.notify(Notification::error(error));
                    client.connection_lost(generation);
                }
                break;
            }
        }
    }
    debug!(generation, "Listener exited");
}
