//! GStreamer-backed connections for `rtsp://`, `rtsps://` and `file://` URIs.
//!
//! Each connection owns one pipeline ending in an RGB appsink. Errors and EOS
//! on the bus turn the next read into a failure; the owning `StreamSource`
//! decides whether to reconnect.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::{Connection, Connector, SourceUri};
use crate::frame::Frame;

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const START_TIMEOUT_SECS: u64 = 5;
const SINK: &str = "appsink name=appsink sync=false max-buffers=1 drop=true";

/// Connector that builds a GStreamer pipeline per connection.
pub struct GstreamerConnector;

impl GstreamerConnector {
    pub fn new() -> Result<Self> {
        gst::init().context("initialize gstreamer")?;
        Ok(Self)
    }
}

impl Connector for GstreamerConnector {
    fn connect(&mut self, uri: &SourceUri) -> Result<Box<dyn Connection>> {
        let (description, location) = match uri.scheme() {
            "rtsp" | "rtsps" => (
                format!(
                    "rtspsrc name=src latency=0 ! decodebin ! videoconvert ! \
                     video/x-raw,format=RGB ! {}",
                    SINK
                ),
                uri.as_str().to_string(),
            ),
            "file" => {
                let path = uri
                    .file_path()
                    .ok_or_else(|| anyhow!("{} is not a local file", uri))?;
                if !path.is_file() {
                    bail!("video file {} does not exist", path.display());
                }
                (
                    format!(
                        "filesrc name=src ! decodebin ! videoconvert ! \
                         video/x-raw,format=RGB ! {}",
                        SINK
                    ),
                    path.to_string_lossy().into_owned(),
                )
            }
            other => bail!("gstreamer cannot open '{}' sources", other),
        };

        let pipeline = gst::parse::launch(&description)
            .context("build gstreamer pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("gstreamer pipeline is not a Pipeline"))?;
        let src = pipeline
            .by_name("src")
            .context("source element missing from pipeline")?;
        src.set_property("location", location.as_str());
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));

        let mut connection = GstreamerConnection {
            pipeline,
            appsink,
            last_error: None,
            released: false,
        };
        connection.start().with_context(|| format!("start pipeline for {}", uri))?;
        log::info!("GstreamerConnection: playing {}", uri);
        Ok(Box::new(connection))
    }
}

struct GstreamerConnection {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    last_error: Option<String>,
    released: bool,
}

impl GstreamerConnection {
    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("set pipeline to Playing")?;
        let (state_change, _, _) = self
            .pipeline
            .state(Some(gst::ClockTime::from_seconds(START_TIMEOUT_SECS)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::Async) => Ok(()),
            Ok(gst::StateChangeSuccess::NoPreroll) => Ok(()),
            Err(_) => {
                self.poll_bus();
                let detail = self.last_error.take().unwrap_or_else(|| "no bus message".to_string());
                self.release();
                Err(anyhow!("pipeline refused to start: {}", detail))
            }
        }
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gst::ClockTime::ZERO) {
            use gst::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached end of stream".to_string());
                }
                _ => {}
            }
        }
    }
}

impl Connection for GstreamerConnection {
    fn read_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            bail!(err);
        }
        let timeout = gst::ClockTime::from_mseconds(READ_TIMEOUT.as_millis() as u64);
        let sample = match self.appsink.try_pull_sample(timeout) {
            Some(sample) => sample,
            None if self.appsink.is_eos() => bail!("gstreamer reached end of stream"),
            None => bail!("no frame within {:?}", READ_TIMEOUT),
        };
        sample_to_frame(&sample)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("GstreamerConnection: failed to stop pipeline: {:?}", err);
        }
    }
}

impl Drop for GstreamerConnection {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_frame(sample: &gst::Sample) -> Result<Frame> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gst_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = usize::try_from(info.stride()[0]).context("negative row stride")?;

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("buffer shorter than its caps")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("buffer row is out of bounds")?,
            );
        }
        pixels
    };

    Ok(Frame::from_rgb(width, height, pixels)?)
}
