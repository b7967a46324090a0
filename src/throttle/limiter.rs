//! Outbound rate limiter: bounded FIFO queues drained by a tick-driven dispatcher

use super::window::ThrottleWindow;
use crate::config::{OverflowPolicy, ThrottleSection, TrafficClassSettings};
use crate::throttle_span;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

/// How long `stop()` waits for an in-flight dispatch pass
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Where dispatched lines go
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Deliver one line; returns false on failure
    ///
    /// The sink reports its own failures. A failed delivery still counts
    /// against the window.
    async fn deliver(&self, line: &str) -> bool;
}

/// Traffic class, each with its own window and queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Standard,
    Privileged,
}

impl TrafficClass {
    /// Drain order within one dispatch pass
    pub const DISPATCH_ORDER: [TrafficClass; 2] = [TrafficClass::Privileged, TrafficClass::Standard];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Standard => "standard",
            TrafficClass::Privileged => "privileged",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Queue at capacity; the new item was refused
    QueueFull,
    /// Queue at capacity; the oldest pending item was dropped for the new one
    EvictedOldest,
}

/// Payload of a Throttled notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleNotice {
    pub reason: ThrottleReason,
    pub class: TrafficClass,
    pub item_not_sent: String,
    /// Sends counted against the window when the item was refused
    pub sent_count: usize,
    pub period: Duration,
    pub allowed_in_period: usize,
}

/// Result of [`RateLimiter::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The new item was refused
    Rejected(ThrottleNotice),
    /// The new item was queued in place of the oldest pending one
    Evicted(ThrottleNotice),
}

impl EnqueueOutcome {
    /// Whether the offered item is now waiting in the queue
    pub fn is_queued(&self) -> bool {
        !matches!(self, EnqueueOutcome::Rejected(_))
    }

    pub fn notice(&self) -> Option<&ThrottleNotice> {
        match self {
            EnqueueOutcome::Queued => None,
            EnqueueOutcome::Rejected(notice) | EnqueueOutcome::Evicted(notice) => Some(notice),
        }
    }
}

struct Lane {
    class: TrafficClass,
    capacity: usize,
    overflow: OverflowPolicy,
    queue: VecDeque<String>,
    window: ThrottleWindow,
}

impl Lane {
    fn new(class: TrafficClass, settings: &TrafficClassSettings) -> Self {
        Self {
            class,
            capacity: settings.queue_capacity,
            overflow: settings.overflow,
            queue: VecDeque::new(),
            window: ThrottleWindow::new(settings.allowed_in_period, settings.period()),
        }
    }

    fn notice(&mut self, reason: ThrottleReason, item: String, now: Instant) -> ThrottleNotice {
        ThrottleNotice {
            reason,
            class: self.class,
            item_not_sent: item,
            sent_count: self.window.sent_in_window(now),
            period: self.window.period(),
            allowed_in_period: self.window.allowed(),
        }
    }

    fn enqueue(&mut self, item: String, now: Instant) -> EnqueueOutcome {
        if self.queue.len() < self.capacity {
            self.queue.push_back(item);
            return EnqueueOutcome::Queued;
        }

        if self.overflow == OverflowPolicy::EvictOldest {
            // Zero-capacity queues have nothing to evict
            if let Some(evicted) = self.queue.pop_front() {
                self.queue.push_back(item);
                return EnqueueOutcome::Evicted(self.notice(
                    ThrottleReason::EvictedOldest,
                    evicted,
                    now,
                ));
            }
        }
        EnqueueOutcome::Rejected(self.notice(ThrottleReason::QueueFull, item, now))
    }

    /// Pop the oldest item if the window has room, recording its send time
    fn next_ready(&mut self, now: Instant) -> Option<String> {
        if self.queue.is_empty() || !self.window.has_capacity(now) {
            return None;
        }
        let item = self.queue.pop_front()?;
        self.window.record(now);
        Some(item)
    }
}

struct Lanes {
    standard: Lane,
    privileged: Lane,
}

impl Lanes {
    fn get_mut(&mut self, class: TrafficClass) -> &mut Lane {
        match class {
            TrafficClass::Standard => &mut self.standard,
            TrafficClass::Privileged => &mut self.privileged,
        }
    }
}

type SharedLanes = Arc<Mutex<Lanes>>;

fn lock(lanes: &Mutex<Lanes>) -> MutexGuard<'_, Lanes> {
    lanes.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DispatchRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-class bounded queues plus the background dispatcher that drains them
///
/// Queues and windows live as long as the limiter; `start`/`stop` only
/// control the dispatcher, so pending items survive a reconnect.
pub struct RateLimiter {
    lanes: SharedLanes,
    tick: Duration,
    run: Mutex<Option<DispatchRun>>,
}

impl RateLimiter {
    pub fn new(settings: &ThrottleSection) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(Lanes {
                standard: Lane::new(TrafficClass::Standard, &settings.standard),
                privileged: Lane::new(TrafficClass::Privileged, &settings.privileged),
            })),
            tick: settings.tick(),
            run: Mutex::new(None),
        }
    }

    /// Offer a line to the class queue
    pub fn enqueue(&self, class: TrafficClass, item: impl Into<String>) -> EnqueueOutcome {
        let outcome = lock(&self.lanes)
            .get_mut(class)
            .enqueue(item.into(), Instant::now());

        if let Some(notice) = outcome.notice() {
            warn!(
                class = %class,
                reason = ?notice.reason,
                sent_count = notice.sent_count,
                allowed_in_period = notice.allowed_in_period,
                next_slot_in = ?self.next_slot_in(class),
                "Outbound queue full"
            );
        }
        outcome
    }

    /// Time until the class window frees a slot, `None` if one is free now
    pub fn next_slot_in(&self, class: TrafficClass) -> Option<Duration> {
        let now = Instant::now();
        lock(&self.lanes)
            .get_mut(class)
            .window
            .next_slot(now)
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn pending(&self, class: TrafficClass) -> usize {
        lock(&self.lanes).get_mut(class).queue.len()
    }

    pub fn sent_in_window(&self, class: TrafficClass) -> usize {
        lock(&self.lanes)
            .get_mut(class)
            .window
            .sent_in_window(Instant::now())
    }

    pub fn is_running(&self) -> bool {
        self.run_slot().is_some()
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<DispatchRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the dispatcher; no-op if it is already running
    pub fn start(&self, sink: Weak<dyn OutboundSink>) {
        let mut slot = self.run_slot();
        if slot.is_some() {
            trace!("Rate limiter already running");
            return;
        }

        let token = CancellationToken::new();
        let span = throttle_span!(tick_ms = self.tick.as_millis() as u64);
        let handle = tokio::spawn(
            run_dispatcher(self.lanes.clone(), sink, self.tick, token.clone()).instrument(span),
        );
        *slot = Some(DispatchRun { token, handle });
        debug!("Rate limiter started");
    }

    /// Stop the dispatcher, waiting briefly for an in-flight pass
    pub async fn stop(&self) {
        let run = self.run_slot().take();
        let Some(mut run) = run else {
            return;
        };
        run.token.cancel();
        if tokio::time::timeout(STOP_GRACE, &mut run.handle)
            .await
            .is_err()
        {
            warn!("Rate limiter did not stop within grace period, aborting");
            run.handle.abort();
        }
        debug!("Rate limiter stopped");
    }

    /// Signal the dispatcher to stop without waiting for it
    pub fn cancel(&self) {
        if let Some(run) = self.run_slot().take() {
            run.token.cancel();
        }
    }

    /// Run one dispatch pass against `sink`, returning the number of lines sent
    pub async fn dispatch_ready(&self, sink: &dyn OutboundSink) -> usize {
        dispatch_pass(&self.lanes, sink, &CancellationToken::new()).await
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tick", &self.tick)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn dispatch_pass(
    lanes: &Mutex<Lanes>,
    sink: &dyn OutboundSink,
    token: &CancellationToken,
) -> usize {
    let mut sent = 0;
    for class in TrafficClass::DISPATCH_ORDER {
        loop {
            if token.is_cancelled() {
                return sent;
            }
            // Lock is released before delivery
            let next = lock(lanes).get_mut(class).next_ready(Instant::now());
            let Some(item) = next else { break };

            if !sink.deliver(&item).await {
                debug!(class = %class, "Queued line failed to send");
            }
            sent += 1;
        }
    }
    sent
}

async fn run_dispatcher(
    lanes: SharedLanes,
    sink: Weak<dyn OutboundSink>,
    tick: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(sink) = sink.upgrade() else {
            debug!("Sink dropped, dispatcher exiting");
            break;
        };
        let sent = dispatch_pass(&lanes, sink.as_ref(), &token).await;
        if sent > 0 {
            trace!(sent, "Dispatched queued lines");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
        failing: AtomicBool,
    }

    impl RecordingSink {
        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn deliver(&self, line: &str) -> bool {
            self.delivered.lock().unwrap().push(line.to_string());
            !self.failing.load(Ordering::SeqCst)
        }
    }

    fn settings(allowed: usize, capacity: usize, overflow: OverflowPolicy) -> ThrottleSection {
        ThrottleSection {
            tick_ms: 10,
            standard: TrafficClassSettings {
                allowed_in_period: allowed,
                period_secs: 30,
                queue_capacity: capacity,
                overflow,
            },
            privileged: TrafficClassSettings {
                allowed_in_period: allowed * 5,
                period_secs: 30,
                queue_capacity: capacity,
                overflow,
            },
        }
    }

    #[tokio::test]
    async fn test_burst_dispatches_up_to_allowance() {
        let limiter = RateLimiter::new(&settings(20, 25, OverflowPolicy::RejectNewest));
        let sink = RecordingSink::default();

        for i in 0..25 {
            assert_eq!(
                limiter.enqueue(TrafficClass::Standard, format!("PRIVMSG #c :{i}")),
                EnqueueOutcome::Queued
            );
        }

        assert_eq!(limiter.dispatch_ready(&sink).await, 20);
        assert_eq!(limiter.pending(TrafficClass::Standard), 5);
        assert_eq!(limiter.sent_in_window(TrafficClass::Standard), 20);

        // Window is full, nothing more goes out
        assert_eq!(limiter.dispatch_ready(&sink).await, 0);
        assert_eq!(sink.delivered().len(), 20);
    }

    #[tokio::test]
    async fn test_rejection_reports_window_usage() {
        let limiter = RateLimiter::new(&settings(20, 5, OverflowPolicy::RejectNewest));
        let sink = RecordingSink::default();

        for batch in 0..4 {
            for i in 0..5 {
                limiter.enqueue(TrafficClass::Standard, format!("{batch}-{i}"));
            }
            limiter.dispatch_ready(&sink).await;
        }
        assert_eq!(limiter.sent_in_window(TrafficClass::Standard), 20);
        let wait = limiter.next_slot_in(TrafficClass::Standard).unwrap();
        assert!(wait > Duration::from_secs(29) && wait <= Duration::from_secs(30));
        assert_eq!(limiter.next_slot_in(TrafficClass::Privileged), None);

        for i in 0..5 {
            assert!(limiter.enqueue(TrafficClass::Standard, format!("late-{i}")).is_queued());
        }

        match limiter.enqueue(TrafficClass::Standard, "overflow") {
            EnqueueOutcome::Rejected(notice) => {
                assert_eq!(notice.reason, ThrottleReason::QueueFull);
                assert_eq!(notice.item_not_sent, "overflow");
                assert_eq!(notice.sent_count, 20);
                assert_eq!(notice.allowed_in_period, 20);
                assert_eq!(notice.period, Duration::from_secs(30));
                assert_eq!(notice.class, TrafficClass::Standard);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(limiter.pending(TrafficClass::Standard), 5);
    }

    #[tokio::test]
    async fn test_evict_oldest_keeps_newest() {
        let limiter = RateLimiter::new(&settings(1, 2, OverflowPolicy::EvictOldest));
        let sink = RecordingSink::default();

        limiter.enqueue(TrafficClass::Standard, "a");
        limiter.dispatch_ready(&sink).await;
        limiter.enqueue(TrafficClass::Standard, "b");
        limiter.enqueue(TrafficClass::Standard, "c");

        match limiter.enqueue(TrafficClass::Standard, "d") {
            EnqueueOutcome::Evicted(notice) => {
                assert_eq!(notice.reason, ThrottleReason::EvictedOldest);
                assert_eq!(notice.item_not_sent, "b");
                assert_eq!(notice.sent_count, 1);
            }
            other => panic!("expected eviction, got {other:?}"),
        }

        let lanes = lock(&limiter.lanes);
        assert_eq!(lanes.standard.queue, VecDeque::from(vec!["c".to_string(), "d".to_string()]));
    }

    #[tokio::test]
    async fn test_zero_capacity_rejects_even_when_evicting() {
        let limiter = RateLimiter::new(&settings(1, 0, OverflowPolicy::EvictOldest));
        let outcome = limiter.enqueue(TrafficClass::Standard, "x");
        assert!(matches!(outcome, EnqueueOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_fifo_order_and_failed_sends_count() {
        let limiter = RateLimiter::new(&settings(3, 10, OverflowPolicy::RejectNewest));
        let sink = RecordingSink::default();
        sink.failing.store(true, Ordering::SeqCst);

        for item in ["one", "two", "three", "four"] {
            limiter.enqueue(TrafficClass::Standard, item);
        }
        assert_eq!(limiter.dispatch_ready(&sink).await, 3);
        assert_eq!(sink.delivered(), vec!["one", "two", "three"]);
        assert_eq!(limiter.sent_in_window(TrafficClass::Standard), 3);
    }

    #[tokio::test]
    async fn test_classes_have_independent_windows() {
        let limiter = RateLimiter::new(&settings(1, 10, OverflowPolicy::RejectNewest));
        let sink = RecordingSink::default();

        for i in 0..3 {
            limiter.enqueue(TrafficClass::Standard, format!("s{i}"));
            limiter.enqueue(TrafficClass::Privileged, format!("p{i}"));
        }
        limiter.dispatch_ready(&sink).await;

        assert_eq!(sink.delivered(), vec!["p0", "p1", "p2", "s0"]);
        assert_eq!(limiter.pending(TrafficClass::Standard), 2);
        assert_eq!(limiter.pending(TrafficClass::Privileged), 0);
    }

    #[tokio::test]
    async fn test_background_dispatcher_drains_queue() {
        let limiter = RateLimiter::new(&settings(20, 25, OverflowPolicy::RejectNewest));
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn OutboundSink> = Arc::downgrade(&sink) as Weak<dyn OutboundSink>;

        limiter.start(weak.clone());
        limiter.start(weak);
        assert!(limiter.is_running());

        for i in 0..5 {
            limiter.enqueue(TrafficClass::Standard, format!("line {i}"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.delivered().len(), 5);

        limiter.stop().await;
        limiter.stop().await;
        assert!(!limiter.is_running());

        // Stopped dispatcher leaves new items queued
        limiter.enqueue(TrafficClass::Standard, "held");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.pending(TrafficClass::Standard), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let limiter = RateLimiter::new(&ThrottleSection::default());
        limiter.stop().await;
        limiter.cancel();
        assert!(!limiter.is_running());
    }

    #[tokio::test]
    async fn test_dispatcher_exits_when_sink_dropped() {
        let limiter = RateLimiter::new(&settings(20, 25, OverflowPolicy::RejectNewest));
        let sink = Arc::new(RecordingSink::default());
        limiter.start(Arc::downgrade(&sink) as Weak<dyn OutboundSink>);
        drop(sink);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let finished = limiter
            .run_slot()
            .as_ref()
            .map(|run| run.handle.is_finished())
            .unwrap_or(false);
        assert!(finished);
    }
}
