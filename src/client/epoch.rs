//! Connection epochs: one cancellation scope per connect-to-close cycle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

/// Cancellation scope for one connection cycle
///
/// An epoch is immutable once issued; closing cancels it and a new epoch with
/// a strictly larger generation takes its place.
#[derive(Debug, Clone)]
pub struct ConnectionEpoch {
    generation: u64,
    token: CancellationToken,
}

impl ConnectionEpoch {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            token: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Holder of the current epoch; readers see either the old or the new one
#[derive(Debug)]
pub struct EpochCell {
    current: RwLock<ConnectionEpoch>,
    next_generation: AtomicU64,
}

impl EpochCell {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(ConnectionEpoch::new(1)),
            next_generation: AtomicU64::new(2),
        }
    }

    // Epochs are swapped whole, so a poisoned lock still holds a valid one
    fn read(&self) -> RwLockReadGuard<'_, ConnectionEpoch> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> ConnectionEpoch {
        self.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn is_current_cancelled(&self) -> bool {
        self.read().is_cancelled()
    }

    /// Cancel the current epoch without replacing it
    pub fn cancel_current(&self) -> ConnectionEpoch {
        let epoch = self.current();
        epoch.cancel();
        epoch
    }

    /// Cancel the current epoch and install a fresh one
    pub fn rotate(&self) -> ConnectionEpoch {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let fresh = ConnectionEpoch::new(generation);
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        current.cancel();
        *current = fresh.clone();
        fresh
    }
}

impl Default for EpochCell {
    fn default() -> Self {
        Self::new()
    }
}
