//! Seam to the external beat/phase clock.
//!
//! The engine never implements clock logic; it hands the collaborator a
//! [`DeferredCommand`] and applies it once the scheduler fires it at a sync
//! point. The command carries its own cancellation flag tied to the player's
//! lifetime, so a scheduler holding on to it past the player's death fires
//! into nothing instead of into freed state.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How transport commands align to the musical grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    #[default]
    None,
    Beat,
    Phase,
}

/// Transport operations that can be deferred to a sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCmd {
    Play(bool),
    Rewind,
}

const SCHEDULED: u8 = 0;
const FIRED: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// One scheduled transport command. The scheduler fires it; the owning
/// player consumes it on its next tick.
pub struct DeferredCommand {
    command: TransportCmd,
    state: AtomicU8,
}

impl DeferredCommand {
    pub fn new(command: TransportCmd) -> Arc<Self> {
        Arc::new(Self {
            command,
            state: AtomicU8::new(SCHEDULED),
        })
    }

    /// Called by the scheduler at the sync point. Returns false when the
    /// command was cancelled (or already fired) and must not take effect.
    pub fn fire(&self) -> bool {
        self.state
            .compare_exchange(SCHEDULED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Withdraw a command that has not fired yet. Once fired it can no
    /// longer be cancelled, only consumed.
    pub fn cancel(&self) {
        let _ = self.state.compare_exchange(
            SCHEDULED,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Consume a fired command; `None` while it is still scheduled.
    pub(crate) fn take(&self) -> Option<TransportCmd> {
        self.state
            .compare_exchange(FIRED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.command)
    }

    /// Whether this command still blocks another deferred command.
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), SCHEDULED | FIRED)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// External clock collaborator. Implementations live in the mixing
/// application; the engine only schedules against it.
pub trait SyncClock: Send + Sync {
    /// Fire `command` at the next beat.
    fn schedule_at_beat(&self, command: Arc<DeferredCommand>);

    /// Fire `command` at the next phase boundary.
    fn schedule_at_phase(&self, command: Arc<DeferredCommand>);

    /// Time remaining until the next sync point of `mode`.
    fn time_to_sync(&self, mode: SyncMode) -> Duration;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Clock that records scheduled commands and fires them on demand.
    #[derive(Default)]
    pub struct ManualClock {
        pub scheduled: Mutex<Vec<Arc<DeferredCommand>>>,
    }

    impl ManualClock {
        pub fn fire_all(&self) {
            for cmd in self.scheduled.lock().drain(..) {
                cmd.fire();
            }
        }
    }

    impl SyncClock for ManualClock {
        fn schedule_at_beat(&self, command: Arc<DeferredCommand>) {
            self.scheduled.lock().push(command);
        }

        fn schedule_at_phase(&self, command: Arc<DeferredCommand>) {
            self.scheduled.lock().push(command);
        }

        fn time_to_sync(&self, _mode: SyncMode) -> Duration {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_then_take_yields_command() {
        let cmd = DeferredCommand::new(TransportCmd::Play(true));
        assert!(cmd.is_pending());
        assert!(cmd.take().is_none());
        assert!(cmd.fire());
        assert_eq!(cmd.take(), Some(TransportCmd::Play(true)));
        assert!(!cmd.is_pending());
    }

    #[test]
    fn test_cancelled_command_never_fires() {
        let cmd = DeferredCommand::new(TransportCmd::Rewind);
        cmd.cancel();
        assert!(!cmd.fire());
        assert!(cmd.take().is_none());
        assert!(cmd.is_cancelled());
    }

    #[test]
    fn test_fire_is_one_shot() {
        let cmd = DeferredCommand::new(TransportCmd::Play(false));
        assert!(cmd.fire());
        assert!(!cmd.fire());
        assert_eq!(cmd.take(), Some(TransportCmd::Play(false)));
        assert!(cmd.take().is_none());
    }

    #[test]
    fn test_cancel_after_fire_is_ignored() {
        let cmd = DeferredCommand::new(TransportCmd::Play(true));
        assert!(cmd.fire());
        cmd.cancel();
        assert_eq!(cmd.take(), Some(TransportCmd::Play(true)));
    }
}
