//! Process-wide accounting of live players.
//!
//! An explicit service object rather than a global: the application creates
//! one registry for its lifetime and injects it into every player. It owns
//! the probe lanes bounding concurrent discovery and the set of players
//! currently holding an open pipeline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::discover::ProbeLanes;

pub struct PlayerRegistry {
    lanes: Arc<ProbeLanes>,
    players: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self {
            lanes: Arc::new(ProbeLanes::default()),
            players: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl PlayerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn lanes(&self) -> Arc<ProbeLanes> {
        Arc::clone(&self.lanes)
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: u64) {
        self.players.lock().insert(id);
        debug!(id, "player registered");
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.players.lock().remove(&id);
        debug!(id, "player deregistered");
    }

    /// Number of players currently holding an open pipeline.
    pub fn live_players(&self) -> usize {
        self.players.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_deregister_round_trip() {
        let registry = PlayerRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
        registry.register(a);
        registry.register(b);
        assert_eq!(registry.live_players(), 2);
        registry.deregister(a);
        assert_eq!(registry.live_players(), 1);
        // Deregistering twice is harmless.
        registry.deregister(a);
        assert_eq!(registry.live_players(), 1);
    }
}
