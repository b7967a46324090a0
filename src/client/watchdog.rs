//! Health watchdog: detects lost connections, drives reconnects, sends keepalives

use super::events::Notification;
use super::SupervisedClient;
use crate::config::WatchdogSection;
use crate::error::{ClientError, ClientResult};
use crate::observability::metrics;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `stop()` waits for the loop to observe cancellation
const STOP_GRACE: Duration = Duration::from_millis(500);

tokio::task_local! {
    // Run id of the watchdog loop executing on this task
    static RUNNING_LOOP: u64;
}

struct WatchdogRun {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type RunSlot = Arc<Mutex<Option<WatchdogRun>>>;

fn lock(slot: &Mutex<Option<WatchdogRun>>) -> MutexGuard<'_, Option<WatchdogRun>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background monitor with its own cancellation scope
///
/// The scope is independent of connection epochs: a reconnect driven by the
/// watchdog replaces the epoch but leaves the watchdog running.
pub struct Watchdog {
    settings: WatchdogSection,
    run: RunSlot,
    next_id: AtomicU64,
}

impl Watchdog {
    pub fn new(settings: WatchdogSection) -> Self {
        Self {
            settings,
            run: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run).is_some()
    }

    /// Start monitoring `client`
    ///
    /// Fails with [`ClientError::WatchdogAlreadyRunning`] and a Fatal
    /// notification if a loop is already active.
    pub fn start(&self, client: Weak<dyn SupervisedClient>) -> ClientResult<()> {
        {
            let mut slot = lock(&self.run);
            if slot.is_none() {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let token = CancellationToken::new();
                let handle = tokio::spawn(RUNNING_LOOP.scope(
                    id,
                    supervise(
                        self.settings.clone(),
                        client,
                        token.clone(),
                        self.run.clone(),
                        id,
                    ),
                ));
                *slot = Some(WatchdogRun { id, token, handle });
                info!(
                    poll_ms = self.settings.poll_interval_ms,
                    keepalive_secs = self.settings.keepalive_interval_secs,
                    "Watchdog started"
                );
                return Ok(());
            }
        }

        error!("Watchdog start requested while already running");
        if let Some(client) = client.upgrade() {
            client.notify(Notification::fatal(
                "watchdog already running",
                Some(Arc::new(ClientError::WatchdogAlreadyRunning)),
            ));
        }
        Err(ClientError::WatchdogAlreadyRunning)
    }

    /// Cancel the loop and clear the scope so a later `start` is allowed
    pub async fn stop(&self) {
        let run = lock(&self.run).take();
        let Some(mut run) = run else {
            return;
        };
        run.token.cancel();

        // Stopping from inside the loop (its reconnect failed and it closed
        // the client): the loop exits on its own once close returns
        let on_own_task = RUNNING_LOOP.try_with(|id| *id == run.id).unwrap_or(false);
        if on_own_task {
            debug!("Watchdog stopped from its own loop");
            return;
        }

        if tokio::time::timeout(STOP_GRACE, &mut run.handle)
            .await
            .is_err()
        {
            warn!("Watchdog did not stop within grace period, aborting");
            run.handle.abort();
        }
        debug!("Watchdog stopped");
    }

    /// Signal the loop to stop without waiting for it
    pub fn cancel(&self) {
        if let Some(run) = lock(&self.run).take() {
            run.token.cancel();
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Clear the slot if it still belongs to run `id`
fn release(slot: &Mutex<Option<WatchdogRun>>, id: u64) {
    let mut slot = lock(slot);
    if slot.as_ref().map(|run| run.id) == Some(id) {
        if let Some(run) = slot.take() {
            run.token.cancel();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "watchdog loop panicked".to_string()
    }
}

async fn supervise(
    settings: WatchdogSection,
    client: Weak<dyn SupervisedClient>,
    token: CancellationToken,
    slot: RunSlot,
    id: u64,
) {
    let outcome = AssertUnwindSafe(watch(&settings, &client, &token))
        .catch_unwind()
        .await;

    if let Err(panic) = outcome {
        if token.is_cancelled() {
            debug!("Watchdog fault after cancellation ignored");
        } else {
            let fault = Arc::new(ClientError::watchdog_fault(panic_message(panic.as_ref())));
            error!(error = %fault, "Watchdog loop faulted");
            metrics().watchdog_fault();
            if let Some(client) = client.upgrade() {
                client.notify(Notification::Error {
                    error: fault.clone(),
                });
                client.notify(Notification::fatal("watchdog fault", Some(fault)));
                // Unsupervised connections are not kept
                client.close().await;
            }
        }
    }

    release(&slot, id);
}

async fn watch(
    settings: &WatchdogSection,
    client: &Weak<dyn SupervisedClient>,
    token: &CancellationToken,
) {
    let poll = settings.poll_interval();
    let keepalive_interval = settings.keepalive_interval();
    // Counts poll ticks, not wall-clock time
    let mut since_keepalive = Duration::ZERO;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Watchdog cancelled");
                return;
            }
            _ = tokio::time::sleep(poll) => {}
        }

        let Some(client) = client.upgrade() else {
            debug!("Client dropped, watchdog exiting");
            return;
        };

        if !client.is_connected() {
            warn!("Connection lost, reconnecting");
            metrics().connection_lost();
            client.notify(Notification::StateChanged {
                is_connected: false,
                was_connected: true,
            });

            let reconnected = client.reconnect_internal().await;
            if token.is_cancelled() {
                return;
            }
            if !reconnected {
                error!("Reconnect failed, closing client");
                client.close().await;
                return;
            }

            info!("Connection restored");
            client.notify(Notification::StateChanged {
                is_connected: true,
                was_connected: false,
            });
        }

        since_keepalive += poll;
        if since_keepalive >= keepalive_interval {
            since_keepalive = Duration::ZERO;
            debug!("Sending keepalive");
            metrics().keepalive_sent();
            client.send(&settings.keepalive_line).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FakeClient {
        connected: AtomicBool,
        reconnect_succeeds: AtomicBool,
        reconnects: AtomicUsize,
        closes: AtomicUsize,
        panic_on_check: AtomicBool,
        sent: Mutex<Vec<String>>,
        notifications: Mutex<Vec<Notification>>,
    }

    impl FakeClient {
        fn kinds(&self) -> Vec<&'static str> {
            self.notifications
                .lock()
                .unwrap()
                .iter()
                .map(Notification::kind)
                .collect()
        }
    }

    #[async_trait]
    impl SupervisedClient for FakeClient {
        fn is_connected(&self) -> bool {
            if self.panic_on_check.load(Ordering::SeqCst) {
                panic!("liveness check exploded");
            }
            self.connected.load(Ordering::SeqCst)
        }

        async fn send(&self, line: &str) -> bool {
            self.sent.lock().unwrap().push(line.to_string());
            true
        }

        async fn reconnect_internal(&self) -> bool {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            let ok = self.reconnect_succeeds.load(Ordering::SeqCst);
            self.connected.store(ok, Ordering::SeqCst);
            ok
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_lost(&self, _generation: u64) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn notify(&self, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }
    }

    fn fast_settings() -> WatchdogSection {
        WatchdogSection {
            poll_interval_ms: 10,
            keepalive_interval_secs: 1,
            keepalive_line: "PING :keepalive".to_string(),
        }
    }

    fn as_weak(client: &Arc<FakeClient>) -> Weak<dyn SupervisedClient> {
        Arc::downgrade(client) as Weak<dyn SupervisedClient>
    }

    #[tokio::test]
    async fn test_start_twice_fails_with_fatal() {
        let client = Arc::new(FakeClient::default());
        client.connected.store(true, Ordering::SeqCst);
        let watchdog = Watchdog::new(fast_settings());

        watchdog.start(as_weak(&client)).unwrap();
        let second = watchdog.start(as_weak(&client));
        assert!(matches!(second, Err(ClientError::WatchdogAlreadyRunning)));
        assert_eq!(client.kinds(), vec!["fatal"]);
        assert!(watchdog.is_running(), "Existing run is untouched");

        watchdog.stop().await;
        assert!(!watchdog.is_running());

        // Scope cleared, restart allowed
        watchdog.start(as_weak(&client)).unwrap();
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let watchdog = Watchdog::new(fast_settings());
        watchdog.stop().await;
        watchdog.stop().await;
        watchdog.cancel();
        assert!(!watchdog.is_running());
    }

    #[tokio::test]
    async fn test_reconnects_lost_connection() {
        let client = Arc::new(FakeClient::default());
        client.reconnect_succeeds.store(true, Ordering::SeqCst);
        let watchdog = Watchdog::new(fast_settings());

        watchdog.start(as_weak(&client)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        watchdog.stop().await;

        assert_eq!(client.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(client.kinds(), vec!["state_changed", "state_changed"]);
        let notifications = client.notifications.lock().unwrap();
        assert!(matches!(
            notifications[0],
            Notification::StateChanged {
                is_connected: false,
                was_connected: true
            }
        ));
        assert!(matches!(
            notifications[1],
            Notification::StateChanged {
                is_connected: true,
                was_connected: false
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_reconnect_closes_and_exits() {
        let client = Arc::new(FakeClient::default());
        let watchdog = Watchdog::new(fast_settings());

        watchdog.start(as_weak(&client)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(client.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
        // Loop released its own scope on exit
        assert!(!watchdog.is_running());
    }

    #[tokio::test]
    async fn test_keepalive_after_accumulated_polls() {
        let client = Arc::new(FakeClient::default());
        client.connected.store(true, Ordering::SeqCst);
        let watchdog = Watchdog::new(fast_settings());

        watchdog.start(as_weak(&client)).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        watchdog.stop().await;

        let sent = client.sent.lock().unwrap().clone();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|line| line == "PING :keepalive"));
    }

    #[tokio::test]
    async fn test_fault_emits_error_then_fatal_and_closes_client() {
        let client = Arc::new(FakeClient::default());
        client.panic_on_check.store(true, Ordering::SeqCst);
        let watchdog = Watchdog::new(fast_settings());

        watchdog.start(as_weak(&client)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(client.kinds(), vec!["error", "fatal"]);
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_running());
    }

    #[tokio::test]
    async fn test_cancellation_is_silent() {
        let client = Arc::new(FakeClient::default());
        client.connected.store(true, Ordering::SeqCst);
        let watchdog = Watchdog::new(fast_settings());

        watchdog.start(as_weak(&client)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        watchdog.stop().await;

        assert!(client.kinds().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "watchdog loop panicked");
    }
}
