//! Asynchronous discovery: each probe runs on its own thread and hands its
//! result back over a channel the player polls from `update()`.
//!
//! Discovery is expensive (it prerolls a throwaway pipeline), so probes are
//! bounded to two in flight process-wide by a pair of lanes: a probe tries
//! the primary lane without blocking and otherwise queues on the secondary.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::info::{probe_uri, MediaInfo};

/// Two mutual-exclusion lanes bounding concurrent probes to 2.
#[derive(Default)]
pub struct ProbeLanes {
    primary: Mutex<()>,
    secondary: Mutex<()>,
}

impl ProbeLanes {
    /// Take a lane, blocking until one frees up. The primary lane is tried
    /// without blocking first so two probes can run side by side.
    fn acquire(&self) -> LaneGuard<'_> {
        match self.primary.try_lock() {
            Some(guard) => LaneGuard::Primary(guard),
            None => LaneGuard::Secondary(self.secondary.lock()),
        }
    }
}

enum LaneGuard<'a> {
    Primary(parking_lot::MutexGuard<'a, ()>),
    Secondary(parking_lot::MutexGuard<'a, ()>),
}

/// Handle to one in-flight probe.
pub(crate) struct Discovery {
    rx: Receiver<MediaInfo>,
}

impl Discovery {
    /// Non-blocking poll; `None` while the probe is still running. Returns
    /// `Some` exactly once.
    pub(crate) fn poll(&self) -> Option<MediaInfo> {
        match self.rx.try_recv() {
            Ok(info) => Some(info),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(MediaInfo::invalid("", "discovery task vanished"))
            }
        }
    }

    /// Bounded wait used by `close()` so teardown never races a probe that
    /// is still initializing state. The result is discarded by the caller.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<MediaInfo> {
        match self.rx.recv_timeout(timeout) {
            Ok(info) => Some(info),
            Err(RecvTimeoutError::Timeout) => {
                warn!("discovery still running after {timeout:?}, abandoning result");
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Launch a probe for `uri` on its own thread. Never blocks the caller; the
/// lane is taken inside the probe thread.
pub(crate) fn spawn_probe(uri: String, lanes: Arc<ProbeLanes>) -> Discovery {
    let (tx, rx) = bounded(1);
    let spawned = thread::Builder::new()
        .name("media-probe".into())
        .spawn(move || {
            let _lane = lanes.acquire();
            debug!(uri = %uri, "probe lane acquired");
            let info = probe_uri(&uri);
            // Receiver may be gone if the player closed early; the result is
            // simply discarded unread.
            let _ = tx.send(info);
        });
    if let Err(err) = spawned {
        warn!("failed to spawn probe thread: {err}");
    }
    Discovery { rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_at_most_two_lanes_held_concurrently() {
        let lanes = Arc::new(ProbeLanes::default());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lanes = Arc::clone(&lanes);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                let _lane = lanes.acquire();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_primary_lane_is_preferred_when_free() {
        let lanes = ProbeLanes::default();
        let first = lanes.acquire();
        assert!(matches!(first, LaneGuard::Primary(_)));
        let second = lanes.acquire();
        assert!(matches!(second, LaneGuard::Secondary(_)));
    }
}
