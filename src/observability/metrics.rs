//! Thread-safe metrics collection system
//!
//! Atomic counters for connection lifecycle, line traffic and throttling,
//! plus a bounded window of connect latencies.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Connect latencies kept for percentile reporting
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    closes: AtomicU64,
    connection_start_time: AtomicU64,

    // Line traffic
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    messages_received: AtomicU64,
    keepalives_sent: AtomicU64,

    // Throttling
    messages_queued: AtomicU64,
    messages_throttled: AtomicU64,

    // Watchdog
    watchdog_faults: AtomicU64,

    connect_latencies: Mutex<VecDeque<u64>>, // in milliseconds

    client_state: Mutex<String>,
    state_transitions: AtomicU64,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
            messages_queued: AtomicU64::new(0),
            messages_throttled: AtomicU64::new(0),
            watchdog_faults: AtomicU64::new(0),
            connect_latencies: Mutex::new(VecDeque::new()),
            client_state: Mutex::new("disconnected".to_string()),
            state_transitions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection lifecycle
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self, latency: Duration) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_connect_latency(latency);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn reconnect_started(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connect_latency(&self, latency: Duration) {
        if let Ok(mut samples) = self.connect_latencies.lock() {
            samples.push_back(latency.as_millis() as u64);
            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.pop_front();
            }
        }
    }

    // Line traffic
    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_sent(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Throttling
    pub fn message_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_throttled(&self) {
        self.messages_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watchdog_fault(&self) {
        self.watchdog_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_client_state(&self, state: &str) {
        if let Ok(mut current_state) = self.client_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnects,
            &self.closes,
            &self.connection_start_time,
            &self.messages_sent,
            &self.send_failures,
            &self.messages_received,
            &self.keepalives_sent,
            &self.messages_queued,
            &self.messages_throttled,
            &self.watchdog_faults,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut samples) = self.connect_latencies.lock() {
            samples.clear();
        }
        if let Ok(mut state) = self.client_state.lock() {
            *state = "disconnected".to_string();
        }
    }

    /// Connect latency statistics: (avg, p50, p95, p99)
    fn connect_latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(samples) = self.connect_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if samples.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    fn current_client_state(&self) -> String {
        self.client_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.connect_latency_statistics();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                closes: self.closes.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
                avg_connect_latency_ms: avg,
                connect_latency_p50_ms: p50,
                connect_latency_p95_ms: p95,
                connect_latency_p99_ms: p99,
            },
            traffic: TrafficMetrics {
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                send_failures: self.send_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
                messages_queued: self.messages_queued.load(Ordering::Relaxed),
                messages_throttled: self.messages_throttled.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_client_state(),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                watchdog_faults: self.watchdog_faults.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub traffic: TrafficMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub closes: u64,
    pub connection_duration_seconds: u64,
    pub avg_connect_latency_ms: f64,
    pub connect_latency_p50_ms: f64,
    pub connect_latency_p95_ms: f64,
    pub connect_latency_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct TrafficMetrics {
    pub messages_sent: u64,
    pub send_failures: u64,
    pub messages_received: u64,
    pub keepalives_sent: u64,
    pub messages_queued: u64,
    pub messages_throttled: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub state_transitions: u64,
    pub watchdog_faults: u64,
    pub uptime_seconds: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let collector = MetricsCollector::new();

        collector.connection_attempt();
        collector.connection_failed();
        collector.connection_attempt();
        collector.connection_established(Duration::from_millis(40));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connection.connection_attempts, 2);
        assert_eq!(snapshot.connection.connection_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert!(snapshot.connection.connected);
        assert!((snapshot.connection.avg_connect_latency_ms - 40.0).abs() < f64::EPSILON);

        collector.connection_closed();
        let snapshot = collector.snapshot();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.closes, 1);
        assert_eq!(snapshot.connection.connection_duration_seconds, 0);
    }

    #[test]
    fn test_traffic_metrics() {
        let collector = MetricsCollector::new();

        collector.message_sent();
        collector.message_sent();
        collector.send_failed();
        collector.message_received();
        collector.keepalive_sent();
        collector.message_queued();
        collector.message_throttled();

        let traffic = collector.snapshot().traffic;
        assert_eq!(traffic.messages_sent, 2);
        assert_eq!(traffic.send_failures, 1);
        assert_eq!(traffic.messages_received, 1);
        assert_eq!(traffic.keepalives_sent, 1);
        assert_eq!(traffic.messages_queued, 1);
        assert_eq!(traffic.messages_throttled, 1);
    }

    #[test]
    fn test_state_transitions_count_changes_only() {
        let collector = MetricsCollector::new();

        collector.set_client_state("connecting");
        collector.set_client_state("connecting");
        collector.set_client_state("connected");

        let lifecycle = collector.snapshot().lifecycle;
        assert_eq!(lifecycle.current_state, "connected");
        assert_eq!(lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.message_sent();
                        collector.message_received();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let traffic = collector.snapshot().traffic;
        assert_eq!(traffic.messages_sent, 1000);
        assert_eq!(traffic.messages_received, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.connection_established(Duration::from_millis(i));
        }

        let len = collector.connect_latencies.lock().unwrap().len();
        assert_eq!(len, MAX_LATENCY_SAMPLES);
        // Oldest 500 samples were dropped
        assert!(collector.snapshot().connection.connect_latency_p50_ms > 900.0);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.connection_established(Duration::from_millis(10));
        collector.message_sent();
        collector.set_client_state("connected");

        collector.reset();

        let snapshot = collector.snapshot();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.connections_established, 0);
        assert_eq!(snapshot.traffic.messages_sent, 0);
        assert_eq!(snapshot.lifecycle.current_state, "disconnected");
        assert_eq!(snapshot.connection.avg_connect_latency_ms, 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json["connection"]["connected"].is_boolean());
        assert!(json["traffic"]["messages_throttled"].is_u64());
    }
}
