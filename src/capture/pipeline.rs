//! GStreamer pipeline construction, launch, and bounded teardown
//!
//! One pipeline per camera, described with `gst::parse::launch` strings
//! mirroring what each source kind needs:
//! - rtsp: depay + parse only, the camera already encodes H.264
//! - usb: raw V4L2 capture with local encoding
//! - test: live SMPTE pattern with a clock overlay, for development
//!
//! All pipelines end in an `appsink` emitting complete access units in
//! Annex-B byte-stream form.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{debug, warn};

use super::SourceShared;
use crate::config::{CameraConfig, CameraKind, EncoderKind};
use crate::frame::EncodedFrame;

/// Bounded wait for the pipeline to quiesce during teardown
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to construct pipeline: {0}")]
    Construct(#[from] gst::glib::Error),
    #[error("parse-launch did not produce a pipeline")]
    NotAPipeline,
    #[error("pipeline has no appsink named \"sink\"")]
    MissingSink,
    #[error("pipeline has no message bus")]
    MissingBus,
    #[error("failed to reach PLAYING state: {0}")]
    StateChange(#[from] gst::StateChangeError),
}

/// Terminal bus events that end a running pipeline
#[derive(Debug)]
pub enum BusEvent {
    Error(String),
    Eos,
}

/// Build the parse-launch description for one camera.
pub fn description(cam: &CameraConfig) -> String {
    const SINK: &str =
        "appsink name=sink emit-signals=true sync=false max-buffers=2 drop=true";

    match cam.kind {
        // RTSP cameras already produce H.264; depay and forward
        CameraKind::Rtsp => format!(
            "rtspsrc location={} latency=0 protocols=tcp \
             ! rtph264depay \
             ! h264parse config-interval=-1 \
             ! video/x-h264,stream-format=byte-stream,alignment=au \
             ! {SINK}",
            cam.uri
        ),
        CameraKind::Usb => format!(
            "v4l2src device={} \
             ! video/x-raw,width={},height={},framerate={}/1 \
             ! videoconvert \
             ! {} \
             ! video/x-h264,stream-format=byte-stream,alignment=au,profile=baseline \
             ! h264parse config-interval=-1 \
             ! {SINK}",
            cam.uri,
            cam.width,
            cam.height,
            cam.fps,
            encoder(cam)
        ),
        CameraKind::Test => format!(
            "videotestsrc is-live=true pattern=smpte \
             ! video/x-raw,width={},height={},framerate={}/1 \
             ! videoconvert \
             ! clockoverlay font-desc=\"Sans 36\" time-format=\"%H:%M:%S\" \
             ! {} \
             ! video/x-h264,stream-format=byte-stream,alignment=au,profile=baseline \
             ! h264parse config-interval=-1 \
             ! {SINK}",
            cam.width,
            cam.height,
            cam.fps,
            encoder(cam)
        ),
    }
}

fn encoder(cam: &CameraConfig) -> String {
    match cam.encoder {
        EncoderKind::Software => format!(
            "x264enc tune=zerolatency bitrate={} speed-preset=ultrafast \
             key-int-max={} bframes=0 b-adapt=false",
            cam.bitrate,
            cam.fps * 2
        ),
        EncoderKind::Vaapi => format!(
            "vaapih264enc rate-control=cbr bitrate={} keyframe-period={}",
            cam.bitrate,
            cam.fps * 2
        ),
    }
}

/// A launched pipeline in the PLAYING state, plus its bus.
pub struct ActivePipeline {
    pipeline: gst::Pipeline,
    bus: gst::Bus,
}

impl ActivePipeline {
    /// Parse-launch the camera's pipeline, wire the appsink to the shared
    /// dispatch state, and bring it to PLAYING.
    pub fn launch(shared: &Arc<SourceShared>) -> Result<Self, PipelineError> {
        let desc = description(shared.camera());
        debug!(camera = %shared.camera().id, "launching pipeline: {desc}");

        let pipeline = gst::parse::launch(&desc)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::NotAPipeline)?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or(PipelineError::MissingSink)?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::MissingSink)?;

        let sample_state = Arc::clone(shared);
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    if let Some(frame) = frame_from_sample(&sample) {
                        sample_state.deliver(frame);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = pipeline.bus().ok_or(PipelineError::MissingBus)?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(PipelineError::StateChange(e));
        }

        Ok(Self { pipeline, bus })
    }

    /// Pop the next terminal bus event, waiting at most `timeout`.
    ///
    /// Warnings are logged and swallowed; `None` means nothing terminal
    /// happened within the timeout.
    pub fn next_event(&self, timeout: Duration) -> Option<BusEvent> {
        let msg = self
            .bus
            .timed_pop(gst::ClockTime::from_mseconds(timeout.as_millis() as u64))?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(BusEvent::Error(format!(
                "{} ({:?})",
                err.error(),
                err.debug()
            ))),
            gst::MessageView::Eos(..) => Some(BusEvent::Eos),
            gst::MessageView::Warning(w) => {
                warn!("pipeline warning: {} ({:?})", w.error(), w.debug());
                None
            }
            _ => None,
        }
    }

    /// Tear the pipeline down, waiting up to 3 s for the capture stack to
    /// quiesce before proceeding regardless.
    pub fn shut_down(self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(error = %e, "pipeline refused NULL state transition");
        }
        let (result, _current, _pending) = self
            .pipeline
            .state(gst::ClockTime::from_seconds(TEARDOWN_TIMEOUT.as_secs()));
        if result.is_err() {
            warn!("pipeline did not quiesce within {TEARDOWN_TIMEOUT:?}");
        }
    }
}

/// Extract one encoded access unit from an appsink sample.
fn frame_from_sample(sample: &gst::Sample) -> Option<EncodedFrame> {
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    // GStreamer marks delta units; an unmarked buffer is a keyframe
    let is_keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
    let pts_ns = buffer.pts().map(gst::ClockTime::nseconds).unwrap_or(0);
    Some(EncodedFrame::new(
        Bytes::copy_from_slice(map.as_slice()),
        pts_ns,
        is_keyframe,
    ))
}
