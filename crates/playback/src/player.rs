//! The player façade: one object composing discovery, the decode backend,
//! the frame ring, the transport state machine and the GPU upload path,
//! driven by a single non-blocking `update()` tick.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use timeline::{Direction, Time, Timeline, TIME_INVALID};

use crate::backend::gst::GstBackend;
use crate::backend::{BackendState, DecodeBackend, FrameSink, PipelineDesc, PlayerOptions};
use crate::clock::{DeferredCommand, SyncClock, SyncMode, TransportCmd};
use crate::discover::{spawn_probe, Discovery};
use crate::error::PlayerError;
use crate::gpu::{GpuContext, VideoTexture};
use crate::info::{MediaInfo, DISCOVER_TIMEOUT};
use crate::registry::PlayerRegistry;
use crate::ring::{FrameRing, FrameStatus};

/// Smallest playback rate magnitude; requests below are pulled up to it.
pub const MIN_PLAY_SPEED: f64 = 0.1;
/// Largest playback rate magnitude.
pub const MAX_PLAY_SPEED: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopMode {
    None,
    #[default]
    Rewind,
    Bidirectional,
}

type BackendFactory = Box<dyn Fn(PipelineDesc) -> Box<dyn DecodeBackend> + Send>;

/// Exponential average of observed frame spacing, for the info overlay.
#[derive(Default)]
struct UpdateMeter {
    last: Option<Instant>,
    ema_secs: f64,
}

impl UpdateMeter {
    fn frame(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last {
            let dt = now.duration_since(prev).as_secs_f64();
            self.ema_secs = if self.ema_secs > 0.0 {
                self.ema_secs * 0.9 + dt * 0.1
            } else {
                dt
            };
        }
        self.last = Some(now);
    }

    fn framerate(&self) -> f64 {
        if self.ema_secs > 0.0 {
            1.0 / self.ema_secs
        } else {
            0.0
        }
    }

    fn reset(&mut self) {
        self.last = None;
        self.ema_secs = 0.0;
    }
}

pub struct MediaPlayer {
    id: u64,
    registry: Arc<PlayerRegistry>,
    options: PlayerOptions,
    backend_factory: BackendFactory,

    uri: String,
    state: BackendState,
    discovery: Option<Discovery>,
    media: Option<MediaInfo>,
    timeline: Arc<Mutex<Timeline>>,
    ring: Arc<FrameRing>,
    sink: FrameSink,
    backend: Option<Box<dyn DecodeBackend>>,

    desired_play: bool,
    enabled: bool,
    rate: f64,
    loop_mode: LoopMode,
    position: Time,
    seeking: bool,
    force_software: bool,

    clock: Option<Arc<dyn SyncClock>>,
    sync_mode: SyncMode,
    deferred: Option<Arc<DeferredCommand>>,

    failed: bool,
    log: String,

    texture: Option<VideoTexture>,
    placeholder: Option<VideoTexture>,
    meter: UpdateMeter,
}

impl MediaPlayer {
    pub fn new(registry: Arc<PlayerRegistry>) -> Self {
        Self::with_options(registry, PlayerOptions::default())
    }

    pub fn with_options(registry: Arc<PlayerRegistry>, options: PlayerOptions) -> Self {
        let ring = Arc::new(FrameRing::new());
        let tl = Arc::new(Mutex::new(Timeline::default()));
        let sink = FrameSink::new(Arc::clone(&ring), Arc::clone(&tl));
        Self {
            id: registry.allocate_id(),
            registry,
            options,
            backend_factory: Box::new(|desc| Box::new(GstBackend::new(desc))),
            uri: String::new(),
            state: BackendState::Closed,
            discovery: None,
            media: None,
            timeline: tl,
            ring,
            sink,
            backend: None,
            desired_play: false,
            enabled: true,
            rate: 1.0,
            loop_mode: LoopMode::default(),
            position: TIME_INVALID,
            seeking: false,
            force_software: false,
            clock: None,
            sync_mode: SyncMode::None,
            deferred: None,
            failed: false,
            log: String::new(),
            texture: None,
            placeholder: None,
            meter: UpdateMeter::default(),
        }
    }

    /// Substitute the decode service; used by tests and alternative
    /// backends.
    pub fn set_backend_factory(
        &mut self,
        factory: impl Fn(PipelineDesc) -> Box<dyn DecodeBackend> + Send + 'static,
    ) {
        self.backend_factory = Box::new(factory);
    }

    pub fn set_clock(&mut self, clock: Arc<dyn SyncClock>) {
        self.clock = Some(clock);
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Begin opening `locator`. Never blocks: discovery runs on its own
    /// thread and the open completes inside a later `update()`.
    pub fn open(&mut self, locator: &str) {
        if self.state != BackendState::Closed {
            warn!(id = self.id, "open() on a non-closed player ignored");
            return;
        }
        let uri = match locator_to_uri(locator) {
            Ok(uri) => uri,
            Err(message) => {
                self.fail(PlayerError::InvalidLocator(message));
                return;
            }
        };
        info!(id = self.id, uri = %uri, "opening");
        self.failed = false;
        self.log.clear();
        self.uri = uri.clone();
        self.discovery = Some(spawn_probe(uri, self.registry.lanes()));
        self.state = BackendState::Opening;
        self.registry.register(self.id);
    }

    /// One render tick. Polls discovery, consumes at most one ring slot,
    /// uploads to the GPU when a context is provided, applies fired
    /// deferred commands. Never blocks.
    pub fn update(&mut self, gpu: Option<&GpuContext<'_>>) {
        if let Some(gpu) = gpu {
            if self.placeholder.is_none() {
                self.placeholder = Some(VideoTexture::placeholder(gpu.device, gpu.queue));
            }
        }
        match self.state {
            BackendState::Closed => {}
            BackendState::Opening => {
                let discovered = self.discovery.as_ref().and_then(|d| d.poll());
                if let Some(media) = discovered {
                    self.discovery = None;
                    if media.valid {
                        self.media = Some(media);
                        self.execute_open();
                    } else {
                        let message = media.log.clone();
                        self.media = Some(media);
                        self.fail(PlayerError::Discovery(message));
                    }
                }
            }
            BackendState::Open => {
                if !self.failed {
                    self.apply_deferred();
                    self.consume_frame(gpu);
                    self.check_bounds();
                }
            }
        }
    }

    /// Configure and start the backend from the probe result. Runs inside
    /// `update()` on first open and synchronously on `reopen()`.
    fn execute_open(&mut self) {
        let Some(media) = self.media.clone() else {
            return;
        };

        {
            let step = media.frame_duration();
            let duration = if media.is_image {
                step
            } else if media.duration != TIME_INVALID {
                media.duration
            } else {
                TIME_INVALID
            };
            *self.timeline.lock() = Timeline::new(duration, step);
        }
        self.ring.clear();
        self.sink.reset_first_sample();
        self.sink.set_reverse(self.rate < 0.0);

        let desc = PipelineDesc::from_info(&media, &self.options, self.force_software);
        let mut backend = (self.backend_factory)(desc);
        if let Err(err) = backend.start(self.sink.clone()) {
            self.fail(PlayerError::BackendConstruction(err.to_string()));
            return;
        }
        let want_play = self.desired_play && !media.is_image;
        if let Err(err) = backend.set_playing(want_play) {
            self.fail(PlayerError::BackendStateChange(err.to_string()));
            backend.stop();
            return;
        }
        self.backend = Some(backend);
        self.state = BackendState::Open;
        self.seeking = false;
        self.position = self.timeline.lock().first();
        self.meter.reset();
        info!(
            id = self.id,
            uri = %media.uri,
            width = media.width,
            height = media.height,
            codec = %media.codec,
            "player open"
        );
    }

    fn consume_frame(&mut self, gpu: Option<&GpuContext<'_>>) {
        let ring = Arc::clone(&self.ring);
        let mut end_reached = false;
        if let Some(mut slot) = ring.latest() {
            match slot.status {
                FrameStatus::Invalid => {}
                FrameStatus::Eos => {
                    slot.status = FrameStatus::Invalid;
                    if slot.position != TIME_INVALID {
                        self.position = slot.position;
                    }
                    end_reached = true;
                }
                FrameStatus::Sample | FrameStatus::Preroll => {
                    // A preroll, or the first sample after a seek, uploads
                    // twice so it is not one tick late on screen.
                    let double = self.seeking || slot.status == FrameStatus::Preroll;
                    if let Some(gpu) = gpu {
                        if let Some(image) = slot.image.take() {
                            if self.texture.is_none() {
                                if let Some(media) = &self.media {
                                    self.texture = Some(VideoTexture::new(
                                        gpu.device,
                                        media.width,
                                        media.height,
                                        !media.is_image,
                                    ));
                                }
                            }
                            if let Some(texture) = self.texture.as_mut() {
                                texture.upload(gpu, &image, double);
                            }
                        }
                    }
                    self.position = slot.position;
                    self.seeking = false;
                    slot.status = FrameStatus::Invalid;
                    self.meter.frame();
                }
            }
        }
        if end_reached {
            debug!(id = self.id, position = self.position, "end of stream");
            self.seeking = false;
            self.handle_end();
        }
    }

    /// Loop handling, triggered by an EOS marker or by the position leaving
    /// the timeline.
    fn handle_end(&mut self) {
        let (first, last, begin, end) = {
            let tl = self.timeline.lock();
            (tl.first(), tl.last(), tl.begin(), tl.end())
        };
        match self.loop_mode {
            LoopMode::Rewind => {
                let target = if self.rate >= 0.0 { first } else { last };
                self.execute_seek(target);
            }
            LoopMode::Bidirectional => {
                self.rate = -self.rate;
                self.sink.set_reverse(self.rate < 0.0);
                let target = if self.rate < 0.0 { last } else { first };
                self.execute_seek(target);
            }
            LoopMode::None => {
                self.position = self.position.clamp(begin, end);
                self.execute_play(false);
            }
        }
    }

    fn check_bounds(&mut self) {
        if self.seeking || self.position == TIME_INVALID {
            return;
        }
        let (begin, end) = {
            let tl = self.timeline.lock();
            (tl.begin(), tl.end())
        };
        if end != TIME_INVALID && (self.position > end || self.position < begin) {
            self.handle_end();
        }
    }

    fn apply_deferred(&mut self) {
        let Some(cmd) = self.deferred.clone() else {
            return;
        };
        if cmd.is_cancelled() {
            self.deferred = None;
        } else if let Some(op) = cmd.take() {
            self.deferred = None;
            match op {
                TransportCmd::Play(on) => self.execute_play(on),
                TransportCmd::Rewind => self.execute_rewind(),
            }
        }
    }

    fn pending(&self) -> bool {
        self.deferred.as_ref().map_or(false, |c| c.is_pending())
    }

    /// Queue `cmd` on the clock collaborator when sync is active. Returns
    /// false when the command should run immediately instead.
    fn defer(&mut self, cmd: TransportCmd) -> bool {
        if self.sync_mode == SyncMode::None {
            return false;
        }
        let Some(clock) = self.clock.clone() else {
            return false;
        };
        let deferred = DeferredCommand::new(cmd);
        match self.sync_mode {
            SyncMode::Phase => clock.schedule_at_phase(Arc::clone(&deferred)),
            _ => clock.schedule_at_beat(Arc::clone(&deferred)),
        }
        debug!(id = self.id, ?cmd, "transport command deferred to sync point");
        self.deferred = Some(deferred);
        true
    }

    // ---- transport API -------------------------------------------------

    pub fn play(&mut self, on: bool) {
        if self.failed || !self.enabled || self.pending() || self.single_frame() {
            return;
        }
        if !self.defer(TransportCmd::Play(on)) {
            self.execute_play(on);
        }
    }

    fn execute_play(&mut self, on: bool) {
        self.desired_play = on;
        if self.state != BackendState::Open {
            // Applied when the backend opens.
            return;
        }
        if on {
            let (first, last) = {
                let tl = self.timeline.lock();
                (tl.first(), tl.last())
            };
            // Entering play at the boundary would stop immediately; start
            // from the far side instead.
            if self.rate > 0.0 && self.position >= last {
                self.execute_seek(first);
            } else if self.rate < 0.0 && self.position <= first {
                self.execute_seek(last);
            }
        }
        if let Some(backend) = self.backend.as_mut() {
            if let Err(err) = backend.set_playing(on) {
                self.fail(PlayerError::BackendStateChange(err.to_string()));
                return;
            }
        }
        debug!(id = self.id, playing = on, "transport state applied");
    }

    pub fn is_playing(&self) -> bool {
        !self.failed && !self.single_frame() && self.desired_play
    }

    /// Seek to `target`, clamped into the timeline; a target inside a gap
    /// snaps to the gap boundary matching the play direction. Ignored while
    /// another seek is in flight or the media is not seekable.
    pub fn seek(&mut self, target: Time) {
        if self.failed || !self.enabled || self.seeking {
            return;
        }
        if !self.media.as_ref().map_or(false, |m| m.seekable) {
            return;
        }
        let resolved = {
            let tl = self.timeline.lock();
            let clamped = target.clamp(tl.begin(), tl.end());
            let direction = if self.rate < 0.0 {
                Direction::Backward
            } else {
                Direction::Forward
            };
            tl.resolve(clamped, direction)
        };
        self.execute_seek(resolved);
    }

    fn execute_seek(&mut self, target: Time) {
        if self.state != BackendState::Open {
            self.position = target;
            return;
        }
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        self.seeking = true;
        match backend.seek(target, self.rate) {
            Ok(()) => debug!(id = self.id, target, rate = self.rate, "seek issued"),
            Err(err) => {
                self.seeking = false;
                self.fail(PlayerError::BackendStateChange(err.to_string()));
            }
        }
    }

    /// Jump to the timeline start (or end under reverse rate). `force`
    /// bypasses both the pending guard and clock deferral.
    pub fn rewind(&mut self, force: bool) {
        if self.failed || !self.enabled {
            return;
        }
        if !force {
            if self.pending() {
                return;
            }
            if self.defer(TransportCmd::Rewind) {
                return;
            }
        }
        self.execute_rewind();
    }

    fn execute_rewind(&mut self) {
        let (first, last) = {
            let tl = self.timeline.lock();
            (tl.first(), tl.last())
        };
        let target = if self.rate >= 0.0 { first } else { last };
        self.execute_seek(target);
    }

    /// Advance a single frame while paused; at the boundary in the current
    /// direction this rewinds instead.
    pub fn step(&mut self) {
        if self.failed || !self.enabled || self.single_frame() || self.desired_play {
            return;
        }
        let (first, last, next, previous) = {
            let tl = self.timeline.lock();
            (
                tl.first(),
                tl.last(),
                tl.next(self.position),
                tl.previous(self.position),
            )
        };
        let at_boundary = (self.rate >= 0.0 && self.position >= last)
            || (self.rate < 0.0 && self.position <= first);
        if at_boundary {
            self.execute_rewind();
            return;
        }
        let stepped = self
            .backend
            .as_mut()
            .map_or(false, |b| b.step_frame().is_ok());
        if !stepped {
            let target = if self.rate >= 0.0 { next } else { previous };
            self.execute_seek(target);
        }
    }

    /// Change the playback rate, preserving sign, magnitude clamped into
    /// `[MIN_PLAY_SPEED, MAX_PLAY_SPEED]`. Keeps the pipeline running with
    /// an in-place rate change when the direction is unchanged; otherwise a
    /// full flushing seek resynchronizes.
    pub fn set_play_speed(&mut self, rate: f64) {
        if self.failed || !rate.is_finite() {
            return;
        }
        let sign = if rate < 0.0 { -1.0 } else { 1.0 };
        let clamped = sign * rate.abs().clamp(MIN_PLAY_SPEED, MAX_PLAY_SPEED);
        if (clamped - self.rate).abs() < f64::EPSILON {
            return;
        }
        let same_direction = (clamped < 0.0) == (self.rate < 0.0);
        self.rate = clamped;
        self.sink.set_reverse(clamped < 0.0);
        if self.state != BackendState::Open {
            return;
        }
        let in_place = same_direction
            && !self.single_frame()
            && self
                .backend
                .as_mut()
                .map_or(false, |b| b.change_rate(clamped).is_ok());
        if !in_place {
            let target = {
                let tl = self.timeline.lock();
                self.position.clamp(tl.first(), tl.last())
            };
            self.execute_seek(target);
        }
    }

    pub fn play_speed(&self) -> f64 {
        self.rate
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    // ---- queries -------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn valid(&self) -> bool {
        self.media.as_ref().map_or(false, |m| m.valid)
    }

    pub fn is_open(&self) -> bool {
        self.state == BackendState::Open
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Diagnostic text describing the most recent failure or warning.
    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.media.as_ref()
    }

    pub fn width(&self) -> u32 {
        self.media.as_ref().map_or(0, |m| m.width)
    }

    pub fn height(&self) -> u32 {
        self.media.as_ref().map_or(0, |m| m.height)
    }

    pub fn frame_rate(&self) -> f64 {
        self.media.as_ref().map_or(0.0, |m| m.framerate())
    }

    pub fn single_frame(&self) -> bool {
        self.media.as_ref().map_or(false, |m| m.is_image)
            || self.timeline.lock().single_frame() && self.media.is_some()
    }

    pub fn position(&self) -> Time {
        self.position
    }

    pub fn duration(&self) -> Time {
        self.timeline.lock().duration()
    }

    /// Timeline fading at the current position, the per-source alpha the
    /// mixer applies.
    pub fn fading(&self) -> f32 {
        self.timeline.lock().fading_at(self.position)
    }

    pub fn timeline(&self) -> Arc<Mutex<Timeline>> {
        Arc::clone(&self.timeline)
    }

    /// Observed decoded-frame rate, smoothed.
    pub fn update_framerate(&self) -> f64 {
        self.meter.framerate()
    }

    /// Texture to composite this tick: the current frame, or the black
    /// placeholder before the first frame and after failure.
    pub fn texture(&self) -> Option<&wgpu::TextureView> {
        let current = if self.failed { None } else { self.texture.as_ref() };
        current
            .or(self.placeholder.as_ref())
            .map(|t| t.view())
    }

    // ---- lifecycle -----------------------------------------------------

    /// Tear everything down. Idempotent; never blocks on pipeline teardown
    /// (that runs detached), but waits up to the discovery timeout for an
    /// outstanding probe whose result is then discarded unread.
    pub fn close(&mut self) {
        if let Some(cmd) = self.deferred.take() {
            cmd.cancel();
        }
        if self.state == BackendState::Closed && self.discovery.is_none() {
            return;
        }
        if let Some(discovery) = self.discovery.take() {
            let _ = discovery.wait(DISCOVER_TIMEOUT);
        }
        if let Some(mut backend) = self.backend.take() {
            backend.stop();
        }
        self.ring.clear();
        self.sink.reset_first_sample();
        self.texture = None;
        self.state = BackendState::Closed;
        self.seeking = false;
        self.desired_play = false;
        self.meter.reset();
        self.registry.deregister(self.id);
        info!(id = self.id, "player closed");
    }

    /// Close and rebuild the pipeline with the current parameters. Used
    /// whenever a change requires pipeline reconstruction.
    pub fn reopen(&mut self) {
        if self.media.is_none() {
            return;
        }
        self.close();
        self.failed = false;
        self.log.clear();
        self.registry.register(self.id);
        self.execute_open();
    }

    /// Force (or stop forcing) software decoding; rebuilds the pipeline
    /// when one is open.
    pub fn set_software_decoding(&mut self, forced: bool) {
        if self.force_software == forced {
            return;
        }
        self.force_software = forced;
        if self.state == BackendState::Open {
            self.reopen();
        }
    }

    pub fn software_decoding_forced(&self) -> bool {
        self.force_software
    }

    /// Replace the per-media filter description; rebuilds the pipeline when
    /// one is open.
    pub fn set_video_filter(&mut self, filter: Option<String>) {
        if self.options.video_filter == filter {
            return;
        }
        self.options.video_filter = filter;
        if self.state == BackendState::Open {
            self.reopen();
        }
    }

    fn fail(&mut self, error: PlayerError) {
        warn!(id = self.id, error = %error, "player failure");
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(&error.to_string());
        if error.is_sticky() {
            self.failed = true;
        }
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        if let Some(cmd) = self.deferred.take() {
            cmd.cancel();
        }
        self.close();
    }
}

/// Turn a locator into a URI the backend accepts. Already-schemed locators
/// pass through untouched; bare paths become `file://` URIs.
fn locator_to_uri(locator: &str) -> Result<String, String> {
    if locator.trim().is_empty() {
        return Err("empty locator".to_string());
    }
    if let Ok(parsed) = url::Url::parse(locator) {
        // Single-letter schemes are Windows drive letters, not URIs.
        if parsed.scheme().len() > 1 {
            return Ok(parsed.to_string());
        }
    }
    let path = std::path::Path::new(locator);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| e.to_string())?
            .join(path)
    };
    url::Url::from_file_path(&absolute)
        .map(|u| u.to_string())
        .map_err(|_| format!("cannot form a URI from '{locator}'"))
}
