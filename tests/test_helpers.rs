//! Test helpers and utilities for integration tests

use chatlink::client::ChatClient;
use chatlink::config::{
    ClientConfig, ConnectionSection, ReconnectSettings, ThrottleSection, WatchdogSection,
};
use chatlink::reconnect::BackoffPolicy;
use chatlink::testing::MockNetwork;
use std::time::Duration;

/// Fast timings so lifecycle tests finish in milliseconds
#[allow(dead_code)]
pub fn test_config() -> ClientConfig {
    ClientConfig {
        connection: ConnectionSection {
            url: "tcp://127.0.0.1:6667".to_string(),
            secure: false,
            connect_timeout_secs: 1,
            close_grace_ms: 10,
        },
        reconnect: ReconnectSettings {
            max_attempts: Some(3),
            backoff_pattern_ms: vec![5, 10],
            sustained_delay_ms: 10,
        },
        watchdog: WatchdogSection {
            poll_interval_ms: 20,
            keepalive_interval_secs: 60,
            keepalive_line: "PING :keepalive".to_string(),
        },
        throttle: ThrottleSection {
            tick_ms: 10,
            ..ThrottleSection::default()
        },
    }
}

/// Client wired to the mock network with the config's backoff policy
#[allow(dead_code)]
pub fn mock_client(network: &MockNetwork, config: ClientConfig) -> ChatClient {
    let policy = BackoffPolicy::new(config.reconnect.clone());
    ChatClient::new(config, network.factory(), Box::new(policy))
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
#[allow(dead_code)]
pub async fn wait_for<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
