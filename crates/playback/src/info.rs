//! Media metadata captured by the discoverer before a pipeline is built.

use std::time::Duration;

use anyhow::{anyhow, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_pbutils as gst_pbutils;
use gstreamer_pbutils::prelude::*;
use once_cell::sync::OnceCell;
use serde::Serialize;

use timeline::{Time, SECOND, TIME_INVALID};

/// Upper bound on one discovery run; `close()` waits at most this long for
/// an outstanding probe.
pub const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

/// Framerate assumed when the source does not declare one.
pub const DEFAULT_FRAMERATE: (i32, i32) = (30, 1);

static GST_INIT: OnceCell<std::result::Result<(), gst::glib::Error>> = OnceCell::new();

pub(crate) fn ensure_gst_initialized() -> Result<()> {
    GST_INIT
        .get_or_init(gst::init)
        .clone()
        .map_err(|e| anyhow!("failed to initialise GStreamer: {e}"))
}

/// Immutable description of a media source, produced once per discovery and
/// replaced wholesale on reopen.
#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    /// Width adjusted by the pixel aspect ratio.
    pub par_width: u32,
    pub framerate_num: i32,
    pub framerate_den: i32,
    /// True when the source omitted a framerate and the default was applied.
    pub framerate_defaulted: bool,
    pub codec: String,
    pub is_image: bool,
    pub interlaced: bool,
    pub seekable: bool,
    pub has_alpha: bool,
    /// Total duration in nanoseconds; `TIME_INVALID` when unknown.
    pub duration: Time,
    pub valid: bool,
    /// Diagnostic text accumulated during discovery.
    pub log: String,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            uri: String::new(),
            width: 0,
            height: 0,
            par_width: 0,
            framerate_num: DEFAULT_FRAMERATE.0,
            framerate_den: DEFAULT_FRAMERATE.1,
            framerate_defaulted: false,
            codec: String::new(),
            is_image: false,
            interlaced: false,
            seekable: false,
            has_alpha: false,
            duration: TIME_INVALID,
            valid: false,
            log: String::new(),
        }
    }
}

impl MediaInfo {
    pub fn invalid(uri: &str, message: impl Into<String>) -> Self {
        Self {
            uri: uri.to_string(),
            log: message.into(),
            ..Self::default()
        }
    }

    pub fn framerate(&self) -> f64 {
        if self.framerate_den == 0 {
            return 0.0;
        }
        f64::from(self.framerate_num) / f64::from(self.framerate_den)
    }

    /// Duration of one frame in nanoseconds.
    pub fn frame_duration(&self) -> Time {
        if self.framerate_num <= 0 {
            return TIME_INVALID;
        }
        SECOND * self.framerate_den as Time / self.framerate_num as Time
    }
}

/// Run one discovery, blocking the calling thread. Callers run this on a
/// probe thread (see `discover`); the result is always a `MediaInfo`, with
/// failures captured as `valid == false` plus diagnostic text.
pub(crate) fn probe_uri(uri: &str) -> MediaInfo {
    if let Err(err) = ensure_gst_initialized() {
        return MediaInfo::invalid(uri, err.to_string());
    }

    // The discoverer delivers its result on the thread-default main context,
    // so give this probe its own context and loop.
    let ctx = glib::MainContext::new();
    let main_loop = glib::MainLoop::new(Some(&ctx), false);

    let run = ctx.with_thread_default(|| -> Result<MediaInfo> {
        let timeout = gst::ClockTime::from_seconds(DISCOVER_TIMEOUT.as_secs());
        let discoverer = gst_pbutils::Discoverer::new(timeout)
            .map_err(|e| anyhow!("failed to create discoverer: {e}"))?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let loop_handle = main_loop.clone();
        let uri_owned = uri.to_string();
        discoverer.connect_discovered(move |_discoverer, info, error| {
            let _ = tx.try_send(inspect(&uri_owned, info, error));
            loop_handle.quit();
        });

        discoverer.start();
        discoverer
            .discover_uri_async(uri)
            .map_err(|e| anyhow!("failed to start discovery: {e}"))?;
        main_loop.run();
        discoverer.stop();

        Ok(rx
            .try_recv()
            .unwrap_or_else(|_| MediaInfo::invalid(uri, "discovery produced no result")))
    });

    match run {
        Ok(Ok(info)) => info,
        Ok(Err(err)) => MediaInfo::invalid(uri, err.to_string()),
        Err(err) => MediaInfo::invalid(uri, format!("failed to acquire main context: {err}")),
    }
}

/// Build a `MediaInfo` from a finished discovery, best-effort: recoverable
/// discovery errors still inspect whatever streams were found.
fn inspect(
    uri: &str,
    info: &gst_pbutils::DiscovererInfo,
    error: Option<&glib::Error>,
) -> MediaInfo {
    use gst_pbutils::DiscovererResult;

    let mut media = MediaInfo {
        uri: uri.to_string(),
        ..MediaInfo::default()
    };

    match info.result() {
        DiscovererResult::UriInvalid => {
            media.log = format!("invalid URI: {uri}");
            return media;
        }
        DiscovererResult::Timeout => {
            media.log = "discovery timed out".to_string();
            return media;
        }
        DiscovererResult::Busy => {
            media.log = "discoverer busy".to_string();
            return media;
        }
        DiscovererResult::MissingPlugins => {
            // Keep going: streams the installed plugins do understand are
            // still usable.
            media.log = "missing codec support".to_string();
        }
        DiscovererResult::Error => {
            // Best-effort: whatever streams were found are still inspected.
            media.log = error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown discovery error".to_string());
        }
        _ => {}
    }

    media.seekable = info.is_seekable();
    if let Some(duration) = info.duration() {
        media.duration = duration.nseconds();
    }

    let video_streams = info.video_streams();
    let Some(video) = video_streams.first() else {
        if media.log.is_empty() {
            media.log = "no video stream found".to_string();
        }
        return media;
    };

    media.width = video.width().max(1);
    media.height = video.height().max(1);
    let par = video.par();
    media.par_width = if par.denom() > 0 && par.numer() > 0 {
        (media.width as u64 * par.numer() as u64 / par.denom() as u64) as u32
    } else {
        media.width
    };
    media.interlaced = video.is_interlaced();
    media.is_image = video.is_image();

    let framerate = video.framerate();
    if framerate.numer() > 0 && framerate.denom() > 0 {
        media.framerate_num = framerate.numer();
        media.framerate_den = framerate.denom();
    } else {
        media.framerate_defaulted = true;
    }

    if let Some(caps) = video.caps() {
        if let Some(structure) = caps.structure(0) {
            media.codec = describe_caps(structure.name().as_str());
            if let Ok(format) = structure.get::<&str>("format") {
                media.has_alpha = format.contains('A');
            }
        }
    }

    // A clip shorter than two frames cannot really play; treat it as a
    // still image even when not tagged as one.
    if !media.is_image
        && media.duration != TIME_INVALID
        && media.frame_duration() != TIME_INVALID
        && media.duration < 2 * media.frame_duration()
    {
        media.is_image = true;
    }

    if media.is_image {
        media.seekable = false;
    }

    media.valid = true;
    tracing::debug!(
        uri = %media.uri,
        width = media.width,
        height = media.height,
        codec = %media.codec,
        image = media.is_image,
        "discovery complete"
    );
    media
}

fn describe_caps(name: &str) -> String {
    match name {
        "video/x-h264" => "H.264".to_string(),
        "video/x-h265" | "video/x-hevc" => "HEVC".to_string(),
        "video/x-vp8" => "VP8".to_string(),
        "video/x-vp9" => "VP9".to_string(),
        "video/x-av1" => "AV1".to_string(),
        "video/x-prores" => "ProRes".to_string(),
        "video/x-theora" => "Theora".to_string(),
        "image/jpeg" => "JPEG image".to_string(),
        "image/png" => "PNG image".to_string(),
        "image/gif" => "GIF image".to_string(),
        other => other
            .replace("video/x-", "")
            .replace("image/", "")
            .to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_info_is_invalid() {
        let info = MediaInfo::default();
        assert!(!info.valid);
        assert_eq!(info.framerate(), 30.0);
        assert_eq!(info.duration, TIME_INVALID);
    }

    #[test]
    fn test_frame_duration_from_framerate() {
        let info = MediaInfo {
            framerate_num: 25,
            framerate_den: 1,
            ..MediaInfo::default()
        };
        assert_eq!(info.frame_duration(), SECOND / 25);

        let ntsc = MediaInfo {
            framerate_num: 30000,
            framerate_den: 1001,
            ..MediaInfo::default()
        };
        // 29.97 fps is a hair over 33 ms per frame.
        assert!(ntsc.frame_duration() > SECOND / 30);
    }

    #[test]
    fn test_describe_caps_names() {
        assert_eq!(describe_caps("video/x-h264"), "H.264");
        assert_eq!(describe_caps("video/x-hevc"), "HEVC");
        assert_eq!(describe_caps("image/png"), "PNG image");
        assert_eq!(describe_caps("video/x-msvideo"), "MSVIDEO");
    }

    #[test]
    fn test_invalid_constructor_keeps_log() {
        let info = MediaInfo::invalid("file:///missing.mp4", "no such file");
        assert!(!info.valid);
        assert_eq!(info.log, "no such file");
        assert_eq!(info.uri, "file:///missing.mp4");
    }
}
