//! Termination barrier for lock-step generation across peers.
//!
//! When several processes (or threads) each run `generate` over their own
//! shard of a batch while the scorer performs collective operations, every
//! peer must keep calling the scorer until *all* peers are finished.
//! Otherwise a peer that exits early leaves the others blocked inside a
//! collective. The barrier is an all-reduce over "still generating" flags.

use std::sync::{Arc, Condvar, Mutex};

use super::error::{DistributedError, Result};

/// All-reduce of per-peer completion flags.
pub trait TerminationBarrier: Send + Sync {
    /// Report this peer's state and block until every peer has reported.
    ///
    /// Returns `true` once every peer reports finished.
    fn all_finished(&self, this_peer_finished: bool) -> Result<bool>;

    /// Broadcast termination: every peer blocked in (or later entering)
    /// [`all_finished`](Self::all_finished) returns [`DistributedError::Aborted`].
    fn abort(&self);

    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;
}

/// Barrier for a single participant; the all-reduce is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcessBarrier;

impl TerminationBarrier for SingleProcessBarrier {
    fn all_finished(&self, this_peer_finished: bool) -> Result<bool> {
        Ok(this_peer_finished)
    }

    fn abort(&self) {}

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

#[derive(Debug, Default)]
struct RoundState {
    arrived: usize,
    running: usize,
    generation: u64,
    last_all_finished: bool,
    aborted: bool,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    state: Mutex<RoundState>,
    cvar: Condvar,
}

/// In-process peer group: one [`LocalPeer`] per participating thread.
#[derive(Debug, Clone)]
pub struct LocalPeerGroup {
    shared: Arc<Shared>,
}

impl LocalPeerGroup {
    /// # Panics
    /// Panics if `world_size` is 0.
    pub fn new(world_size: usize) -> Self {
        assert!(world_size > 0, "world_size must be > 0");
        Self {
            shared: Arc::new(Shared {
                world_size,
                state: Mutex::new(RoundState::default()),
                cvar: Condvar::new(),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    /// Handle for participant `rank`.
    pub fn peer(&self, rank: usize) -> Result<LocalPeer> {
        if rank >= self.shared.world_size {
            return Err(DistributedError::InvalidRank {
                rank,
                world_size: self.shared.world_size,
            });
        }
        Ok(LocalPeer {
            rank,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// One participant of a [`LocalPeerGroup`].
#[derive(Debug, Clone)]
pub struct LocalPeer {
    rank: usize,
    shared: Arc<Shared>,
}

impl TerminationBarrier for LocalPeer {
    fn all_finished(&self, this_peer_finished: bool) -> Result<bool> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| DistributedError::Poisoned)?;
        if state.aborted {
            return Err(DistributedError::Aborted);
        }

        state.arrived += 1;
        if !this_peer_finished {
            state.running += 1;
        }

        if state.arrived == self.shared.world_size {
            state.last_all_finished = state.running == 0;
            state.arrived = 0;
            state.running = 0;
            state.generation = state.generation.wrapping_add(1);
            self.shared.cvar.notify_all();
            return Ok(state.last_all_finished);
        }

        // A round cannot complete again before this peer re-enters, so
        // `last_all_finished` is still ours to read after waking.
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = self
                .shared
                .cvar
                .wait(state)
                .map_err(|_| DistributedError::Poisoned)?;
        }
        if state.generation == generation {
            return Err(DistributedError::Aborted);
        }
        Ok(state.last_all_finished)
    }

    fn abort(&self) {
        let mut state = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.aborted = true;
        self.shared.cvar.notify_all();
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}
