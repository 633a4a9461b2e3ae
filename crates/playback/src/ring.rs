//! Multi-slot hand-off between the decode backend's callback threads and
//! the render tick.
//!
//! Each slot carries its own lock so the producer can fill one slot while
//! the consumer reads another; a separate short-lived lock guards only the
//! "last fully written" index, so finding the newest ready frame never
//! contends with an in-flight write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use timeline::{Time, TIME_INVALID};

/// Number of ring slots.
pub const N_FRAMES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Invalid,
    Sample,
    Preroll,
    Eos,
}

/// One decoded RGBA image, tightly packed (`width * 4` bytes per row).
#[derive(Clone)]
pub struct FrameImage {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl FrameImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Arc::from(data.into_boxed_slice()),
            width,
            height,
        }
    }
}

pub struct FrameSlot {
    pub status: FrameStatus,
    pub image: Option<FrameImage>,
    pub position: Time,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self {
            status: FrameStatus::Invalid,
            image: None,
            position: TIME_INVALID,
        }
    }
}

impl FrameSlot {
    fn clear(&mut self) {
        self.status = FrameStatus::Invalid;
        self.image = None;
        self.position = TIME_INVALID;
    }
}

pub struct FrameRing {
    slots: [Mutex<FrameSlot>; N_FRAMES],
    /// Index of the newest fully written slot. Dedicated lock, held briefly.
    last_index: Mutex<Option<usize>>,
    /// Producer-side write cursor, advanced modulo `N_FRAMES`.
    write_index: AtomicUsize,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(FrameSlot::default())),
            last_index: Mutex::new(None),
            write_index: AtomicUsize::new(0),
        }
    }
}

impl FrameRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the write target, stepping over a still-unread end-of-stream
    /// marker rather than overwriting it.
    fn write_target(&self) -> usize {
        let mut w = self.write_index.load(Ordering::Acquire);
        let unread_eos = self.slots[w].lock().status == FrameStatus::Eos;
        if unread_eos {
            w = (w + 1) % N_FRAMES;
        }
        w
    }

    /// Producer entry point, invoked from backend callback context.
    ///
    /// `materialize` runs with the slot lock held and produces the image, or
    /// `None` when the sample cannot be mapped; in that case the slot stays
    /// `Invalid` and nothing is published. Returns whether a frame was
    /// published.
    pub fn push_frame(
        &self,
        materialize: impl FnOnce() -> Option<FrameImage>,
        position: Time,
        preroll: bool,
    ) -> bool {
        let w = self.write_target();
        let published = {
            let mut slot = self.slots[w].lock();
            slot.clear();
            match materialize() {
                Some(image) => {
                    slot.image = Some(image);
                    slot.position = position;
                    slot.status = if preroll {
                        FrameStatus::Preroll
                    } else {
                        FrameStatus::Sample
                    };
                    true
                }
                None => false,
            }
        };
        if published {
            *self.last_index.lock() = Some(w);
            self.write_index.store((w + 1) % N_FRAMES, Ordering::Release);
        } else {
            // Keep the cursor on the failed slot; the next sample retries it.
            self.write_index.store(w, Ordering::Release);
        }
        published
    }

    /// Record an end-of-stream marker at `position` (timeline end for
    /// forward play, begin for reverse).
    pub fn push_eos(&self, position: Time) {
        let w = self.write_target();
        {
            let mut slot = self.slots[w].lock();
            slot.clear();
            slot.status = FrameStatus::Eos;
            slot.position = position;
        }
        *self.last_index.lock() = Some(w);
        self.write_index.store((w + 1) % N_FRAMES, Ordering::Release);
    }

    /// Consumer entry point: lock the newest fully written slot. The caller
    /// inspects the status, handles the frame and marks the slot `Invalid`
    /// before dropping the guard.
    pub fn latest(&self) -> Option<MutexGuard<'_, FrameSlot>> {
        let index = *self.last_index.lock();
        index.map(|i| self.slots[i].lock())
    }

    /// Drop all frames and reset both cursors; used on close and flush.
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.lock().clear();
        }
        *self.last_index.lock() = None;
        self.write_index.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn image_filled(byte: u8) -> FrameImage {
        FrameImage::new(vec![byte; 16 * 16 * 4], 16, 16)
    }

    #[test]
    fn test_latest_returns_newest_published() {
        let ring = FrameRing::new();
        assert!(ring.latest().is_none());
        ring.push_frame(|| Some(image_filled(1)), 100, false);
        ring.push_frame(|| Some(image_filled(2)), 200, false);
        let slot = ring.latest().unwrap();
        assert_eq!(slot.status, FrameStatus::Sample);
        assert_eq!(slot.position, 200);
        assert_eq!(slot.image.as_ref().unwrap().data[0], 2);
    }

    #[test]
    fn test_failed_materialize_publishes_nothing() {
        let ring = FrameRing::new();
        ring.push_frame(|| Some(image_filled(7)), 100, false);
        assert!(!ring.push_frame(|| None, 200, false));
        let slot = ring.latest().unwrap();
        // The failed write is invisible; the previous frame is still newest.
        assert_eq!(slot.position, 100);
        assert_eq!(slot.status, FrameStatus::Sample);
    }

    #[test]
    fn test_unread_eos_is_never_overwritten() {
        let ring = FrameRing::new();
        ring.push_eos(9000);
        // Flood the ring with more samples than it has slots.
        for i in 0..(2 * N_FRAMES as u8) {
            ring.push_frame(|| Some(image_filled(i)), u64::from(i) * 10, false);
        }
        let preserved = (0..N_FRAMES).any(|i| {
            // Test-only direct peek at each slot.
            let slot = ring.slots[i].lock();
            slot.status == FrameStatus::Eos && slot.position == 9000
        });
        assert!(preserved, "EOS marker was overwritten");
    }

    #[test]
    fn test_consumed_eos_slot_is_recycled() {
        let ring = FrameRing::new();
        ring.push_eos(5000);
        {
            let mut slot = ring.latest().unwrap();
            assert_eq!(slot.status, FrameStatus::Eos);
            slot.status = FrameStatus::Invalid;
        }
        for i in 0..(N_FRAMES as u8 + 1) {
            ring.push_frame(|| Some(image_filled(i)), u64::from(i), false);
        }
        let eos_left = (0..N_FRAMES).any(|i| ring.slots[i].lock().status == FrameStatus::Eos);
        assert!(!eos_left);
    }

    #[test]
    fn test_preroll_status_round_trip() {
        let ring = FrameRing::new();
        ring.push_frame(|| Some(image_filled(3)), 0, true);
        let slot = ring.latest().unwrap();
        assert_eq!(slot.status, FrameStatus::Preroll);
    }

    #[test]
    fn test_clear_resets_cursors() {
        let ring = FrameRing::new();
        for i in 0..3u8 {
            ring.push_frame(|| Some(image_filled(i)), u64::from(i), false);
        }
        ring.clear();
        assert!(ring.latest().is_none());
        assert_eq!(ring.write_index.load(Ordering::Acquire), 0);
    }

    /// A consumer racing a producer never observes a torn image or a status
    /// outside the slot state set.
    #[test]
    fn test_concurrent_producer_consumer_sees_consistent_slots() {
        let ring = Arc::new(FrameRing::new());
        let producer_ring = Arc::clone(&ring);
        let producer = thread::spawn(move || {
            for i in 0..500u64 {
                let byte = (i % 251) as u8;
                producer_ring.push_frame(|| Some(image_filled(byte)), i, false);
            }
        });

        let mut observed = 0;
        while observed < 200 {
            if let Some(mut slot) = ring.latest() {
                match slot.status {
                    FrameStatus::Sample | FrameStatus::Preroll => {
                        let image = slot.image.as_ref().expect("sample without image");
                        let first = image.data[0];
                        assert!(image.data.iter().all(|&b| b == first), "torn image");
                        slot.status = FrameStatus::Invalid;
                        observed += 1;
                    }
                    FrameStatus::Invalid | FrameStatus::Eos => {}
                }
            }
            if producer.is_finished() {
                break;
            }
        }
        producer.join().unwrap();
    }
}
