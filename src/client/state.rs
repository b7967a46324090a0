//! Client state as observed by callers

use std::fmt;
use tokio::sync::watch;

/// Lifecycle state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Inside the open loop
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// State holder; only the lifecycle core writes to it
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ClientState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClientState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ClientState {
        *self.tx.borrow()
    }

    /// Replace the state, returning the previous one
    pub fn set(&self, state: ClientState) -> ClientState {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Client state transition");
        }
        previous
    }

    /// Move from `from` to `to` only if the current state is `from`
    pub fn replace_if(&self, from: ClientState, to: ClientState) -> bool {
        let replaced = self.tx.send_if_modified(|state| {
            if *state == from && from != to {
                *state = to;
                true
            } else {
                false
            }
        });
        if replaced {
            tracing::debug!(from = %from, to = %to, "Client state transition");
        }
        replaced
    }

    pub fn watch(&self) -> watch::Receiver<ClientState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
