//! In-flight load accounting.
//!
//! A higher-level scheduler (and the tileset destructor) needs to know when
//! all outstanding loads have settled. Every async operation the tileset
//! starts (tile content fetches, bootstrap document fetches, subtree
//! fetches, token refreshes) increments the counter up front and
//! decrements it exactly once when the operation finishes, regardless of
//! outcome. The decrement rides in a drop guard so even a panicking
//! continuation cannot stall a waiter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Counts loads in progress for one tileset.
#[derive(Debug, Default)]
pub struct LoadAccounting {
    in_flight: AtomicUsize,
}

impl LoadAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of one async load.
    pub fn notify_tile_start_loading(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Records the completion of one async load.
    pub fn notify_tile_done_loading(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            // Underflow means a double-notify; restore and complain.
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            warn!("tile load accounting underflow: done notified without a matching start");
        }
    }

    /// Number of loads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Starts one load and returns a guard that signals completion exactly
    /// once when dropped.
    pub(crate) fn start(self: &Arc<Self>) -> LoadGuard {
        self.notify_tile_start_loading();
        LoadGuard(self.clone())
    }
}

/// Drop guard pairing one `start` with exactly one `done`.
pub(crate) struct LoadGuard(Arc<LoadAccounting>);

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.notify_tile_done_loading();
    }
}
