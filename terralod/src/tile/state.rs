//! The tile load-state field.
//!
//! The state is read and advanced from multiple threads: the main thread
//! triggers loads and finalizes content, the transport's completion runs
//! wherever the transport chooses, and decode work runs on a worker. All
//! transitions go through an atomic field with release/acquire ordering, so
//! a reader observing `ContentLoaded` is guaranteed to see the content
//! published immediately before the store. The one transition that must be
//! race-free against the worker continuation, `ContentLoading ->
//! Destroying`, uses compare-and-exchange.

use std::sync::atomic::{AtomicU8, Ordering};

/// The current state of a tile in the loading process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TileLoadState {
    /// Not loaded beyond the metadata in the tileset document.
    Unloaded = 0,

    /// A content request is in flight.
    ContentLoading = 1,

    /// Content has been decoded; main-thread finalization is pending.
    ContentLoaded = 2,

    /// Completely loaded.
    Done = 3,

    /// Loading failed permanently; the tile will not be retried.
    Failed = 4,

    /// Loading failed but may be retried, for example after a token
    /// refresh.
    FailedTemporarily = 5,

    /// The tile is being destroyed while a background continuation may
    /// still reference it. The continuation observes this state and
    /// abandons its result.
    Destroying = 6,
}

impl TileLoadState {
    fn from_u8(value: u8) -> TileLoadState {
        match value {
            0 => TileLoadState::Unloaded,
            1 => TileLoadState::ContentLoading,
            2 => TileLoadState::ContentLoaded,
            3 => TileLoadState::Done,
            4 => TileLoadState::Failed,
            5 => TileLoadState::FailedTemporarily,
            6 => TileLoadState::Destroying,
            other => unreachable!("invalid tile load state value {}", other),
        }
    }
}

/// Atomically-updated [`TileLoadState`].
#[derive(Debug)]
pub(crate) struct AtomicLoadState(AtomicU8);

impl AtomicLoadState {
    pub(crate) fn new(state: TileLoadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> TileLoadState {
        TileLoadState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: TileLoadState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transitions `current -> new` only if the state is still `current`.
    /// Returns the previous state on failure.
    pub(crate) fn compare_exchange(
        &self,
        current: TileLoadState,
        new: TileLoadState,
    ) -> Result<(), TileLoadState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TileLoadState::from_u8)
    }
}
