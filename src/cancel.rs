//! Cooperative cancellation for background refreshes.
//!
//! The external call behind a refresh can't be interrupted, so a token is
//! checked right before the result is committed. A newer refresh on the
//! same channel, an explicit cancel, or tearing the channel down all make
//! older tokens stale.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct Supersession {
    latest: Arc<AtomicU64>,
    torn_down: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct RefreshToken {
    generation: u64,
    latest: Arc<AtomicU64>,
    torn_down: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl Supersession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a refresh, superseding every earlier token.
    pub fn begin(&self) -> RefreshToken {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        RefreshToken {
            generation,
            latest: Arc::clone(&self.latest),
            torn_down: Arc::clone(&self.torn_down),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The consumer is gone; nothing may commit any more.
    pub fn tear_down(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}

impl RefreshToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
            && !self.torn_down.load(Ordering::SeqCst)
            && self.latest.load(Ordering::SeqCst) == self.generation
    }

    /// Stores `value` in `slot` only if this token is still current.
    /// Returns whether it was stored.
    pub fn commit<T>(&self, slot: &Mutex<T>, value: T) -> bool {
        let Ok(mut guard) = slot.lock() else {
            return false;
        };
        // checked under the lock so a newer commit can't be overwritten
        if !self.is_current() {
            log::debug!("discarding superseded refresh #{}", self.generation);
            return false;
        }
        *guard = value;
        true
    }
}
