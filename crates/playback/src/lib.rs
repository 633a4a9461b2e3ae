//! Media playback engine for the mixer: open a locator, probe it
//! asynchronously, run a decode pipeline against a lock-protected frame
//! ring, and expose the freshly decoded frame as a GPU texture every tick —
//! without ever blocking the render loop.
//!
//! The façade is [`MediaPlayer`]; the mixing graph owns any number of them,
//! injects one [`PlayerRegistry`] for the application lifetime and drives
//! [`MediaPlayer::update`] from its render thread. Transport controls can be
//! aligned to a musical grid through a [`SyncClock`] collaborator.

pub mod backend;
pub mod clock;
pub mod discover;
pub mod error;
pub mod gpu;
pub mod info;
pub mod player;
pub mod registry;
pub mod ring;

pub use backend::{BackendError, DecodeBackend, FrameSink, PipelineDesc, PlayerOptions};
pub use clock::{DeferredCommand, SyncClock, SyncMode, TransportCmd};
pub use error::PlayerError;
pub use gpu::{DualStaging, GpuContext, StageHandle, VideoTexture};
pub use info::{MediaInfo, DISCOVER_TIMEOUT};
pub use player::{LoopMode, MediaPlayer, MAX_PLAY_SPEED, MIN_PLAY_SPEED};
pub use registry::PlayerRegistry;
pub use ring::{FrameImage, FrameRing, FrameStatus, N_FRAMES};
