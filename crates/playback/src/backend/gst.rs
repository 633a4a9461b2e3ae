//! GStreamer implementation of [`DecodeBackend`].
//!
//! The pipeline is assembled element by element from a [`PipelineDesc`]:
//! `uridecodebin` feeding an optional deinterlacer, constant-framerate shim
//! and still-image freeze shim, an optional caller-supplied filter bin, and
//! a `videoconvert ! capsfilter ! appsink` tail pinned to RGBA at the probed
//! resolution. Appsink callbacks push every sample into the [`FrameSink`].

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use gstreamer_video::VideoFrameExt;
use tracing::{debug, info, warn};

use timeline::{Time, TIME_INVALID};

use crate::info::ensure_gst_initialized;
use crate::ring::{FrameImage, N_FRAMES};

use super::{BackendError, DecodeBackend, FrameSink, PipelineDesc};

pub struct GstBackend {
    desc: PipelineDesc,
    pipeline: Option<gst::Pipeline>,
}

impl GstBackend {
    pub fn new(desc: PipelineDesc) -> Self {
        Self {
            desc,
            pipeline: None,
        }
    }

    fn pipeline(&self) -> Result<&gst::Pipeline, BackendError> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| BackendError::StateChange("pipeline not started".into()))
    }
}

impl DecodeBackend for GstBackend {
    fn start(&mut self, sink: FrameSink) -> Result<(), BackendError> {
        ensure_gst_initialized().map_err(|e| BackendError::Construction(e.to_string()))?;
        let pipeline = build_pipeline(&self.desc, sink)
            .map_err(|e| BackendError::Construction(format!("{e:#}")))?;

        // Come up paused so the first preroll lands before any play request.
        pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| BackendError::Construction(format!("set PAUSED: {e}")))?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            // Teardown can stall on network sources; run it detached so the
            // caller never waits on it.
            let spawned = std::thread::Builder::new()
                .name("pipeline-teardown".into())
                .spawn(move || {
                    if let Err(err) = pipeline.set_state(gst::State::Null) {
                        warn!("pipeline teardown failed: {err}");
                    }
                    drop(pipeline);
                });
            if let Err(err) = spawned {
                warn!("failed to spawn teardown thread: {err}");
            }
        }
    }

    fn set_playing(&mut self, playing: bool) -> Result<(), BackendError> {
        let state = if playing {
            gst::State::Playing
        } else {
            gst::State::Paused
        };
        self.pipeline()?
            .set_state(state)
            .map(|_| ())
            .map_err(|e| BackendError::StateChange(format!("set {state:?}: {e}")))
    }

    fn seek(&mut self, target: Time, rate: f64) -> Result<(), BackendError> {
        let pipeline = self.pipeline()?;
        let flags = gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE;
        let target = gst::ClockTime::from_nseconds(target);
        let result = if rate >= 0.0 {
            pipeline.seek(
                rate,
                flags,
                gst::SeekType::Set,
                Some(target),
                gst::SeekType::Set,
                gst::ClockTime::NONE,
            )
        } else {
            // Reverse playback runs the segment from `stop` down to `start`.
            pipeline.seek(
                rate,
                flags,
                gst::SeekType::Set,
                Some(gst::ClockTime::ZERO),
                gst::SeekType::Set,
                Some(target),
            )
        };
        result.map_err(|_| BackendError::StateChange(format!("seek to {target} refused")))
    }

    fn step_frame(&mut self) -> Result<(), BackendError> {
        let step = gst::event::Step::new(gst::format::Buffers::ONE, 1.0, true, false);
        if self.pipeline()?.send_event(step) {
            Ok(())
        } else {
            Err(BackendError::StateChange("step event refused".into()))
        }
    }

    fn change_rate(&mut self, rate: f64) -> Result<(), BackendError> {
        let event = gst::event::Seek::new(
            rate,
            gst::SeekFlags::INSTANT_RATE_CHANGE,
            gst::SeekType::None,
            gst::ClockTime::NONE,
            gst::SeekType::None,
            gst::ClockTime::NONE,
        );
        if self.pipeline()?.send_event(event) {
            Ok(())
        } else {
            Err(BackendError::StateChange(format!(
                "instant rate change to {rate} refused"
            )))
        }
    }

    fn position(&self) -> Option<Time> {
        self.pipeline
            .as_ref()?
            .query_position::<gst::ClockTime>()
            .map(|t| t.nseconds())
    }
}

impl Drop for GstBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pad_is_video(pad: &gst::Pad) -> bool {
    pad.current_caps()
        .or_else(|| Some(pad.query_caps(None)))
        .and_then(|caps| {
            caps.structure(0)
                .map(|s| s.name().starts_with("video/") || s.name().starts_with("image/"))
        })
        .unwrap_or_else(|| pad.name().starts_with("video"))
}

fn build_pipeline(desc: &PipelineDesc, sink: FrameSink) -> Result<gst::Pipeline> {
    let pipeline = gst::Pipeline::with_name("media-playback");

    let decode = gst::ElementFactory::make("uridecodebin")
        .property("uri", &desc.uri)
        .build()
        .with_context(|| format!("make uridecodebin for {}", desc.uri))?;
    if desc.force_software {
        decode.set_property("force-sw-decoders", true);
    }

    // Static tail of the pipeline, in link order.
    let mut chain: Vec<gst::Element> = Vec::new();

    if desc.deinterlace {
        chain.push(
            gst::ElementFactory::make("deinterlace")
                .build()
                .context("make deinterlace")?,
        );
    }
    if desc.constant_rate_shim {
        chain.push(
            gst::ElementFactory::make("videorate")
                .build()
                .context("make videorate")?,
        );
    }
    if desc.freeze_image {
        chain.push(
            gst::ElementFactory::make("imagefreeze")
                .build()
                .context("make imagefreeze")?,
        );
    }
    if let Some(ref filter) = desc.filter {
        let bin = gst::parse::bin_from_description(filter, true)
            .with_context(|| format!("parse filter description '{filter}'"))?;
        chain.push(bin.upcast());
    }

    chain.push(
        gst::ElementFactory::make("videoconvert")
            .build()
            .context("make videoconvert")?,
    );

    let mut caps = gst::Caps::builder("video/x-raw")
        .field("format", "RGBA")
        .field("width", desc.width as i32)
        .field("height", desc.height as i32);
    if desc.constant_rate_shim {
        caps = caps.field("framerate", gst::Fraction::new(30, 1));
    }
    let caps = caps.build();
    chain.push(
        gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .context("make capsfilter")?,
    );

    let appsink = gst_app::AppSink::builder()
        .caps(&caps)
        .max_buffers(N_FRAMES as u32)
        .build();
    install_callbacks(&appsink, sink);

    pipeline.add(&decode).context("add uridecodebin")?;
    let refs: Vec<&gst::Element> = chain.iter().collect();
    pipeline.add_many(&refs).context("add pipeline tail")?;
    pipeline
        .add(appsink.upcast_ref::<gst::Element>())
        .context("add appsink")?;

    let mut link: Vec<&gst::Element> = chain.iter().collect();
    link.push(appsink.upcast_ref());
    gst::Element::link_many(&link).context("link pipeline tail")?;

    let head = chain
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("pipeline tail is empty"))?;
    let head_weak = head.downgrade();
    decode.connect_pad_added(move |_decode, src_pad| {
        let Some(head) = head_weak.upgrade() else {
            return;
        };
        let Some(sink_pad) = head.static_pad("sink") else {
            return;
        };
        if sink_pad.is_linked() {
            return;
        }
        if !pad_is_video(src_pad) {
            debug!(pad = %src_pad.name(), "ignoring non-video pad from uridecodebin");
            return;
        }
        if let Err(err) = src_pad.link(&sink_pad) {
            warn!(
                pad = %src_pad.name(),
                error = ?err,
                "failed to link uridecodebin video pad"
            );
        }
    });

    info!(
        uri = %desc.uri,
        width = desc.width,
        height = desc.height,
        deinterlace = desc.deinterlace,
        software = desc.force_software,
        "decode pipeline built"
    );
    Ok(pipeline)
}

fn install_callbacks(appsink: &gst_app::AppSink, sink: FrameSink) {
    let sample_sink = sink.clone();
    let preroll_sink = sink.clone();
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Flushing)?;
                deliver_sample(&sample_sink, &sample, false);
                Ok(gst::FlowSuccess::Ok)
            })
            .new_preroll(move |appsink| {
                let sample = appsink
                    .pull_preroll()
                    .map_err(|_| gst::FlowError::Flushing)?;
                deliver_sample(&preroll_sink, &sample, true);
                Ok(gst::FlowSuccess::Ok)
            })
            .eos(move |_appsink| {
                sink.deliver_eos();
            })
            .build(),
    );
}

fn deliver_sample(sink: &FrameSink, sample: &gst::Sample, preroll: bool) {
    let Some(buffer) = sample.buffer() else {
        // Signal carrying no data: end of stream.
        sink.deliver_eos();
        return;
    };
    let pts = buffer.pts().map(|t| t.nseconds()).unwrap_or(TIME_INVALID);
    let delivered = sink.deliver(|| materialize(sample), pts, preroll);
    if !delivered {
        debug!(pts, "sample could not be materialized, tick skipped");
    }
}

/// Map the sample and repack it into a tightly packed RGBA image. Returns
/// `None` on map failure; that frame is simply dropped.
fn materialize(sample: &gst::Sample) -> Option<FrameImage> {
    let buffer = sample.buffer()?;
    let caps = sample.caps()?;
    let video_info = gst_video::VideoInfo::from_caps(caps).ok()?;
    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &video_info).ok()?;

    let width = video_info.width() as usize;
    let height = video_info.height() as usize;
    let stride = frame.plane_stride()[0] as usize;
    let data = frame.plane_data(0).ok()?;

    let row = width * 4;
    let mut packed = Vec::with_capacity(row * height);
    if stride == row {
        packed.extend_from_slice(data.get(..row * height)?);
    } else {
        for y in 0..height {
            let offset = y * stride;
            packed.extend_from_slice(data.get(offset..offset + row)?);
        }
    }
    Some(FrameImage::new(
        packed,
        video_info.width(),
        video_info.height(),
    ))
}
