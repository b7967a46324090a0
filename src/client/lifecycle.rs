//! Lifecycle core: open, close, send and reconnect against one transport slot

use super::epoch::{ConnectionEpoch, EpochCell};
use super::events::{EventBus, Notification};
use super::orchestrator::ServiceOrchestrator;
use super::state::{ClientState, StateCell};
use super::SupervisedClient;
use crate::config::ClientConfig;
use crate::connection_span;
use crate::error::{ClientError, ClientResult};
use crate::observability::metrics;
use crate::reconnect::{BackoffPolicy, ReconnectPolicy, ResetMode};
use crate::throttle::{EnqueueOutcome, OutboundSink, TrafficClass};
use crate::transport::{EndpointFactory, Transport, TransportFactory};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

/// Handle to a managed connection
///
/// Cloning is cheap; every clone drives the same connection.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    policy: Mutex<Box<dyn ReconnectPolicy>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    epochs: EpochCell,
    state: StateCell,
    events: EventBus,
    // One send in flight at a time
    send_gate: Semaphore,
    // Serializes open, close and reconnect
    lifecycle: Mutex<()>,
    orchestrator: ServiceOrchestrator,
    this: Weak<ClientInner>,
}

impl ChatClient {
    pub fn new(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        policy: Box<dyn ReconnectPolicy>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| ClientInner {
            orchestrator: ServiceOrchestrator::new(&config),
            config,
            factory,
            policy: Mutex::new(policy),
            transport: RwLock::new(None),
            epochs: EpochCell::new(),
            state: StateCell::new(),
            events: EventBus::new(),
            send_gate: Semaphore::new(1),
            lifecycle: Mutex::new(()),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Client for the configured endpoint with the configured backoff
    pub fn from_config(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let factory = EndpointFactory::from_config(&config)?;
        let policy = BackoffPolicy::new(config.reconnect.clone());
        debug!(
            max_attempts = ?config.reconnect.max_attempts,
            max_backoff_ms = ?policy.calculate_max_total_time(),
            "Reconnect policy configured"
        );
        Ok(Self::new(config, Arc::new(factory), Box::new(policy)))
    }

    /// Connect, retrying per the reconnection policy
    ///
    /// Returns true immediately if already connected. On success emits
    /// Connected; when attempts run out emits Fatal and returns false.
    pub async fn open(&self) -> bool {
        self.inner.open().await
    }

    /// Tear down the connection and all supervision. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Send one line directly, bypassing the rate limiter
    ///
    /// Never panics or raises; failures emit SendFailed and return false.
    pub async fn send(&self, line: &str) -> bool {
        self.inner.send(line).await
    }

    /// Close if connected, then reopen; emits Reconnected on success
    pub async fn reconnect(&self) -> bool {
        if self.is_connected() {
            self.inner.close().await;
        }
        self.inner.reconnect_internal().await
    }

    /// Queue a line on the standard traffic class
    pub fn enqueue(&self, line: impl Into<String>) -> EnqueueOutcome {
        self.enqueue_class(TrafficClass::Standard, line)
    }

    /// Queue a line on the privileged traffic class
    pub fn enqueue_privileged(&self, line: impl Into<String>) -> EnqueueOutcome {
        self.enqueue_class(TrafficClass::Privileged, line)
    }

    pub fn enqueue_class(&self, class: TrafficClass, line: impl Into<String>) -> EnqueueOutcome {
        self.inner.enqueue(class, line.into())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.watch()
    }

    pub fn state(&self) -> ClientState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Generation of the current connection epoch
    pub fn epoch_generation(&self) -> u64 {
        self.inner.epochs.generation()
    }

    /// Lines waiting in the given class queue
    pub fn pending(&self, class: TrafficClass) -> usize {
        self.inner.orchestrator.limiter().pending(class)
    }

    pub fn is_watchdog_running(&self) -> bool {
        self.inner.orchestrator.watchdog().is_running()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("state", &self.state())
            .field("generation", &self.epoch_generation())
            .field("orchestrator", &self.inner.orchestrator)
            .finish()
    }
}

impl ClientInner {
    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install_transport(&self, transport: Option<Arc<dyn Transport>>) -> Option<Arc<dyn Transport>> {
        let mut slot = self.transport.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, transport)
    }

    fn set_state(&self, state: ClientState) {
        self.state.set(state);
        metrics().set_client_state(&state.to_string());
    }

    async fn open(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            debug!("Open requested while connected");
            return true;
        }

        // A dead connection the watchdog has not yet noticed
        if self.current_transport().is_some() || self.orchestrator.is_active() {
            let (stale, fresh) = self.retire_connection().await;
            info!(
                stale_generation = stale.generation(),
                next_generation = fresh.generation(),
                "Discarded dead connection before open"
            );
            self.notify(Notification::Disconnected);
        }

        let opened = self.open_cycle(ResetMode::Fresh).await;
        if opened {
            self.notify(Notification::Connected);
        } else if self.orchestrator.is_active() {
            // Left over from the discarded connection
            self.orchestrator.stop().await;
        }
        opened
    }

    async fn open_cycle(&self, mode: ResetMode) -> bool {
        let epoch = self.epochs.current();
        let span = connection_span!(generation = epoch.generation(), mode = ?mode);
        self.connect_loop(mode, epoch).instrument(span).await
    }

    async fn connect_loop(&self, mode: ResetMode, epoch: ConnectionEpoch) -> bool {
        self.set_state(ClientState::Connecting);
        let connect_timeout = self.config.connection.connect_timeout();

        let mut policy = self.policy.lock().await;
        policy.reset(mode);

        let mut connected = None;
        let mut first_attempt = true;
        while connected.is_none() && !policy.attempts_exhausted() {
            if !first_attempt {
                let delay = policy.next_interval();
                tokio::select! {
                    biased;
                    _ = epoch.token().cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first_attempt = false;

            let attempt = policy.attempts_made() + 1;
            metrics().connection_attempt();
            let started = Instant::now();
            let transport = self.factory.create();

            match tokio::time::timeout(connect_timeout, transport.connect(epoch.token())).await {
                Ok(Ok(())) => {
                    metrics().connection_established(started.elapsed());
                    connected = Some(transport);
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Connect attempt failed");
                    metrics().connection_failed();
                    let _ = transport.close().await;
                }
                Err(_) => {
                    let e = ClientError::ConnectTimeout(connect_timeout);
                    warn!(attempt, error = %e, "Connect attempt timed out");
                    metrics().connection_failed();
                    let _ = transport.close().await;
                }
            }
            policy.advance();

            if epoch.is_cancelled() {
                break;
            }
        }
        let attempts = policy.attempts_made();
        drop(policy);

        if epoch.is_cancelled() {
            if let Some(late) = connected.take() {
                let _ = late.close().await;
            }
        }

        let Some(transport) = connected else {
            self.set_state(ClientState::Disconnected);
            if epoch.is_cancelled() {
                debug!(attempts, "Open abandoned after cancellation");
            } else {
                error!(attempts, "Connection attempts exhausted");
                self.notify(Notification::fatal(
                    "connection attempts exhausted",
                    Some(Arc::new(ClientError::AttemptsExhausted { attempts })),
                ));
            }
            return false;
        };

        if let Some(previous) = self.install_transport(Some(transport.clone())) {
            warn!("Replaced a transport that was never released");
            let _ = previous.close().await;
        }
        self.set_state(ClientState::Connected);

        let client: Weak<dyn SupervisedClient> = self.this.clone();
        let sink: Weak<dyn OutboundSink> = self.this.clone();
        self.orchestrator.start(client, sink, transport, &epoch);

        info!(attempts, "Connected");
        true
    }

    async fn close(&self) {
        // Interrupt an open cycle that would otherwise hold the lifecycle lock
        let interrupted = self.state.get() == ClientState::Connecting;
        if interrupted {
            self.epochs.cancel_current();
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.current_transport().is_none() && !self.orchestrator.is_active() {
            if interrupted {
                self.epochs.rotate();
            }
            debug!("Close requested while already closed");
            return;
        }

        let span = connection_span!(generation = self.epochs.generation(), op = "close");
        async {
            self.set_state(ClientState::Closing);
            // Supervision first, so nothing reconnects mid-teardown
            self.orchestrator.stop().await;

            let closing = self.epochs.cancel_current();
            if let Some(transport) = self.install_transport(None) {
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "Transport close reported an error");
                }
            }
            metrics().connection_closed();
            self.set_state(ClientState::Disconnected);
            self.notify(Notification::Disconnected);

            let fresh = self.epochs.rotate();
            info!(
                closed_generation = closing.generation(),
                next_generation = fresh.generation(),
                "Closed"
            );
            tokio::time::sleep(self.config.connection.close_grace()).await;
        }
        .instrument(span)
        .await
    }

    /// Stop per-connection supervision, release the transport and start a
    /// new epoch. The watchdog keeps running. Caller holds the lifecycle lock.
    async fn retire_connection(&self) -> (ConnectionEpoch, ConnectionEpoch) {
        self.orchestrator.stop_for_reconnect().await;
        let stale = self.epochs.cancel_current();
        if let Some(transport) = self.install_transport(None) {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Stale transport close reported an error");
            }
        }
        self.set_state(ClientState::Disconnected);
        (stale, self.epochs.rotate())
    }

    async fn reconnect_internal(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        metrics().reconnect_started();

        let (stale, fresh) = self.retire_connection().await;
        info!(
            stale_generation = stale.generation(),
            next_generation = fresh.generation(),
            "Reconnecting"
        );

        let reopened = self.open_cycle(ResetMode::Reconnect).await;
        if reopened {
            self.notify(Notification::Reconnected);
        }
        reopened
    }

    async fn send(&self, line: &str) -> bool {
        let result = match self.send_gate.acquire().await {
            Ok(_permit) => match self.current_transport() {
                Some(transport) => transport
                    .send_line(line)
                    .await
                    .map_err(ClientError::from),
                None => Err(ClientError::NotConnected),
            },
            Err(_) => Err(ClientError::NotConnected),
        };

        match result {
            Ok(()) => {
                metrics().message_sent();
                true
            }
            Err(e) => {
                warn!(error = %e, "Send failed");
                metrics().send_failed();
                self.notify(Notification::SendFailed {
                    error: Arc::new(e),
                    message: line.to_string(),
                });
                false
            }
        }
    }

    fn enqueue(&self, class: TrafficClass, line: String) -> EnqueueOutcome {
        let outcome = self.orchestrator.limiter().enqueue(class, line);
        if outcome.is_queued() {
            metrics().message_queued();
        }
        if let Some(notice) = outcome.notice() {
            metrics().message_throttled();
            self.notify(Notification::Throttled(notice.clone()));
        }
        outcome
    }

    fn is_connected(&self) -> bool {
        self.current_transport()
            .map(|transport| transport.is_alive())
            .unwrap_or(false)
    }

    fn connection_lost(&self, generation: u64) {
        if self.epochs.generation() != generation || self.epochs.is_current_cancelled() {
            return;
        }
        if self.state.replace_if(ClientState::Connected, ClientState::Disconnected) {
            metrics().set_client_state(&ClientState::Disconnected.to_string());
        }
    }

    fn notify(&self, notification: Notification) {
        // A cancelled epoch means teardown is underway
        if !notification.is_teardown() && self.epochs.is_current_cancelled() {
            debug!(kind = notification.kind(), "Notification suppressed during shutdown");
            return;
        }
        self.events.emit(notification);
    }
}

#[async_trait]
impl SupervisedClient for ClientInner {
    fn is_connected(&self) -> bool {
        ClientInner::is_connected(self)
    }

    async fn send(&self, line: &str) -> bool {
        ClientInner::send(self, line).await
    }

    async fn reconnect_internal(&self) -> bool {
        ClientInner::reconnect_internal(self).await
    }

    async fn close(&self) {
        ClientInner::close(self).await
    }

    fn connection_lost(&self, generation: u64) {
        ClientInner::connection_lost(self, generation)
    }

    fn notify(&self, notification: Notification) {
        ClientInner::notify(self, notification)
    }
}

#[async_trait]
impl OutboundSink for ClientInner {
    async fn deliver(&self, line: &str) -> bool {
        ClientInner::send(self, line).await
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.orchestrator.cancel_all();
        self.epochs.cancel_current();
    }
}
