//! Mock transport and notification helpers

use crate::client::Notification;
use crate::error::{TransportError, TransportResult};
use crate::transport::{Transport, TransportFactory};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// What the next connect attempt does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Succeed,
    /// Refused immediately
    Fail,
    /// Never completes until cancelled
    Hang,
}

#[derive(Debug, Default)]
struct NetworkState {
    script: Mutex<VecDeque<ConnectBehavior>>,
    fallback: Mutex<ConnectBehavior>,
    sent: Mutex<Vec<String>>,
    created: AtomicUsize,
    attempts: AtomicUsize,
    connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    send_delay_ms: AtomicU64,
    fail_sends: AtomicBool,
    current: Mutex<Option<Arc<MockTransport>>>,
}

/// Shared state behind every transport the mock factory hands out
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Arc<NetworkState>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue connect outcomes; once exhausted the fallback applies
    pub fn with_script(self, behaviors: impl IntoIterator<Item = ConnectBehavior>) -> Self {
        self.state.script.lock().unwrap().extend(behaviors);
        self
    }

    pub fn set_fallback(&self, behavior: ConnectBehavior) {
        *self.state.fallback.lock().unwrap() = behavior;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state
            .send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(self.clone())
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn transports_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn successful_connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Highest number of sends observed in flight at once
    pub fn max_concurrent_sends(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Arc<MockTransport>> {
        self.state.current.lock().unwrap().clone()
    }

    /// Deliver a line to the most recent transport's reader
    pub fn push_inbound(&self, line: impl Into<String>) -> bool {
        self.current()
            .map(|transport| transport.push_inbound(line))
            .unwrap_or(false)
    }

    /// Liveness goes false while the reader stays blocked
    pub fn drop_liveness(&self) {
        if let Some(transport) = self.current() {
            transport.alive.store(false, Ordering::SeqCst);
        }
    }

    /// The next liveness check on the current transport panics
    pub fn panic_on_next_liveness_check(&self) {
        if let Some(transport) = self.current() {
            transport.panic_on_check.store(true, Ordering::SeqCst);
        }
    }

    /// Peer closes: liveness goes false and the reader sees end of stream
    pub fn hang_up(&self) {
        if let Some(transport) = self.current() {
            transport.alive.store(false, Ordering::SeqCst);
            transport.inbound_tx.lock().unwrap().take();
        }
    }

    fn next_behavior(&self) -> ConnectBehavior {
        let scripted = self.state.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| *self.state.fallback.lock().unwrap())
    }
}

impl TransportFactory for MockNetwork {
    fn create(&self) -> Arc<dyn Transport> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(MockTransport::new(self.clone()));
        *self.state.current.lock().unwrap() = Some(transport.clone());
        transport
    }
}

/// In-memory transport produced by [`MockNetwork`]
pub struct MockTransport {
    network: MockNetwork,
    alive: AtomicBool,
    panic_on_check: AtomicBool,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MockTransport {
    fn new(network: MockNetwork) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            network,
            alive: AtomicBool::new(false),
            panic_on_check: AtomicBool::new(false),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn push_inbound(&self, line: impl Into<String>) -> bool {
        self.inbound_tx
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.send(line.into()).is_ok())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, cancel: &CancellationToken) -> TransportResult<()> {
        let state = &self.network.state;
        state.attempts.fetch_add(1, Ordering::SeqCst);

        match self.network.next_behavior() {
            ConnectBehavior::Succeed => {
                self.alive.store(true, Ordering::SeqCst);
                state.connects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            ConnectBehavior::Fail => Err(TransportError::connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted refusal",
            ))),
            ConnectBehavior::Hang => {
                cancel.cancelled().await;
                Err(TransportError::Cancelled)
            }
        }
    }

    async fn send_line(&self, line: &str) -> TransportResult<()> {
        if !self.is_alive() {
            return Err(TransportError::NotConnected);
        }
        let state = &self.network.state;
        if state.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::send(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted send failure",
            )));
        }

        let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = state.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        state.sent.lock().unwrap().push(line.to_string());

        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_line(&self) -> TransportResult<Option<String>> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(line) => Ok(Some(line)),
            None => {
                self.alive.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.inbound_tx.lock().unwrap().take();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        if self.panic_on_check.swap(false, Ordering::SeqCst) {
            panic!("scripted liveness check failure");
        }
        self.alive.load(Ordering::SeqCst)
    }
}

/// Everything currently buffered on a subscription
pub fn drain_notifications(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut drained = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(notification) => drained.push(notification),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    drained
}

pub fn count_kind(notifications: &[Notification], kind: &str) -> usize {
    notifications.iter().filter(|n| n.kind() == kind).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_connects() {
        let network = MockNetwork::new().with_script([ConnectBehavior::Fail]);
        let token = CancellationToken::new();

        let first = network.create();
        assert!(first.connect(&token).await.is_err());
        assert!(!first.is_alive());

        let second = network.create();
        assert!(second.connect(&token).await.is_ok());
        assert!(second.is_alive());

        assert_eq!(network.transports_created(), 2);
        assert_eq!(network.connect_attempts(), 2);
        assert_eq!(network.successful_connects(), 1);
    }

    #[tokio::test]
    async fn test_hang_resolves_on_cancel() {
        let network = MockNetwork::new().with_script([ConnectBehavior::Hang]);
        let token = CancellationToken::new();
        let transport = network.create();

        token.cancel();
        assert!(matches!(
            transport.connect(&token).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_inbound_and_hang_up() {
        let network = MockNetwork::new();
        let transport = network.create();
        transport.connect(&CancellationToken::new()).await.unwrap();

        assert!(network.push_inbound("PING :server"));
        assert_eq!(
            transport.read_line().await.unwrap().as_deref(),
            Some("PING :server")
        );

        network.hang_up();
        assert_eq!(transport.read_line().await.unwrap(), None);
        assert!(!transport.is_alive());
        assert!(!network.push_inbound("late"));
    }

    #[tokio::test]
    async fn test_liveness_panic_fires_once() {
        let network = MockNetwork::new();
        let transport = network.create();
        transport.connect(&CancellationToken::new()).await.unwrap();

        network.panic_on_next_liveness_check();
        let check = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| transport.is_alive()));
        assert!(check.is_err());
        assert!(transport.is_alive());
    }

    #[tokio::test]
    async fn test_sends_recorded_and_failures_scripted() {
        let network = MockNetwork::new();
        let transport = network.create();
        assert!(transport.send_line("early").await.is_err());

        transport.connect(&CancellationToken::new()).await.unwrap();
        transport.send_line("PRIVMSG #c :hi").await.unwrap();
        assert_eq!(network.sent_lines(), vec!["PRIVMSG #c :hi"]);

        network.set_fail_sends(true);
        assert!(matches!(
            transport.send_line("nope").await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[test]
    fn test_drain_and_count() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(Notification::Connected).unwrap();
        tx.send(Notification::Disconnected).unwrap();
        tx.send(Notification::Connected).unwrap();

        let drained = drain_notifications(&mut rx);
        assert_eq!(drained.len(), 3);
        assert_eq!(count_kind(&drained, "connected"), 2);
        assert!(drain_notifications(&mut rx).is_empty());
    }
}
