//! Seam between the engine and the opaque decode service.
//!
//! The engine only ever talks to a [`DecodeBackend`]; the GStreamer adapter
//! in [`gst`] is the production implementation, and tests substitute a mock.
//! Frames flow the other way through a [`FrameSink`] capability handed to
//! the backend at `start()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use timeline::{Time, Timeline, TIME_INVALID};

use crate::info::MediaInfo;
use crate::ring::{FrameImage, FrameRing};

pub mod gst;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("pipeline construction failed: {0}")]
    Construction(String),
    #[error("state change refused: {0}")]
    StateChange(String),
}

/// Options the surrounding graph sets on a player; the parts that shape the
/// decode pipeline end up in a [`PipelineDesc`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerOptions {
    /// Prefer software decoders even when hardware ones are available.
    pub disable_hardware: bool,
    /// Opaque per-media filter description, inserted verbatim into the
    /// pipeline; the engine does not interpret its syntax.
    pub video_filter: Option<String>,
    /// Let still images be "played" through a freeze shim instead of
    /// rejecting transport controls.
    pub freeze_images: bool,
}

/// Recipe for one decode pipeline, synthesized from the probed metadata and
/// the player options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub deinterlace: bool,
    pub force_software: bool,
    /// Insert a constant-framerate shim for codecs without native per-frame
    /// timestamps.
    pub constant_rate_shim: bool,
    /// Make a still image behave like a seekable stream.
    pub freeze_image: bool,
    pub filter: Option<String>,
}

impl PipelineDesc {
    pub fn from_info(info: &MediaInfo, options: &PlayerOptions, force_software: bool) -> Self {
        Self {
            uri: info.uri.clone(),
            width: info.width,
            height: info.height,
            deinterlace: info.interlaced,
            force_software: options.disable_hardware || force_software,
            constant_rate_shim: info.framerate_defaulted && !info.is_image,
            freeze_image: info.is_image && options.freeze_images,
            filter: options.video_filter.clone(),
        }
    }
}

/// Lifecycle of the adapter around the opaque pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendState {
    #[default]
    Closed,
    Opening,
    Open,
}

/// Control surface of the opaque decode service.
pub trait DecodeBackend: Send {
    /// Build the pipeline and begin pushing frames into `sink`. The backend
    /// comes up paused; `set_playing` requests the desired transport state.
    fn start(&mut self, sink: FrameSink) -> Result<(), BackendError>;

    /// Tear the pipeline down. Must not block the caller on teardown work.
    fn stop(&mut self);

    fn set_playing(&mut self, playing: bool) -> Result<(), BackendError>;

    /// Flushing, accurate seek to `target` at the given signed rate.
    fn seek(&mut self, target: Time, rate: f64) -> Result<(), BackendError>;

    /// Advance exactly one frame while paused.
    fn step_frame(&mut self) -> Result<(), BackendError>;

    /// In-place rate change preserving direction; backends that cannot do
    /// this report `StateChange` and the controller falls back to a seek.
    fn change_rate(&mut self, rate: f64) -> Result<(), BackendError>;

    fn position(&self) -> Option<Time>;
}

/// Capability the backend pushes frames into. Clones share one ring and one
/// timeline with the owning player.
#[derive(Clone)]
pub struct FrameSink {
    ring: Arc<FrameRing>,
    timeline: Arc<Mutex<Timeline>>,
    reverse: Arc<AtomicBool>,
    first_sample_seen: Arc<AtomicBool>,
}

impl FrameSink {
    pub(crate) fn new(ring: Arc<FrameRing>, timeline: Arc<Mutex<Timeline>>) -> Self {
        Self {
            ring,
            timeline,
            reverse: Arc::new(AtomicBool::new(false)),
            first_sample_seen: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver one decoded sample. `materialize` maps the backend's buffer
    /// into a [`FrameImage`] and may fail transiently; `pts` is the sample
    /// presentation timestamp.
    pub fn deliver(
        &self,
        materialize: impl FnOnce() -> Option<FrameImage>,
        pts: Time,
        preroll: bool,
    ) -> bool {
        if pts != TIME_INVALID && !self.first_sample_seen.swap(true, Ordering::AcqRel) {
            // First real sample: it defines the true start of the timeline,
            // with a leading gap when the source starts late.
            let mut tl = self.timeline.lock();
            tl.set_first(pts);
            if pts > tl.begin() {
                let begin = tl.begin();
                let _ = tl.add_gap(begin, pts);
            }
        }
        self.ring.push_frame(materialize, pts, preroll)
    }

    /// Deliver a null sample: recorded as an end-of-stream marker positioned
    /// at the boundary playback is heading toward.
    pub fn deliver_eos(&self) {
        let position = {
            let tl = self.timeline.lock();
            if self.reverse.load(Ordering::Acquire) {
                tl.begin()
            } else {
                tl.end()
            }
        };
        self.ring.push_eos(position);
    }

    /// Keep the sink's idea of the play direction current so EOS markers
    /// land on the right boundary.
    pub(crate) fn set_reverse(&self, reverse: bool) {
        self.reverse.store(reverse, Ordering::Release);
    }

    pub(crate) fn reset_first_sample(&self) {
        self.first_sample_seen.store(false, Ordering::Release);
    }
}
