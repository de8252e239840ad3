//! Network stream source using GStreamer.
//!
//! `uridecodebin` handles RTSP, HTTP and the other schemes GStreamer has
//! plugins for. Any bus error, EOS or stall surfaces as a read error; the
//! capture worker then drops this source (tearing the pipeline down) and
//! reconnects.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::RgbImage;
use std::time::Duration;

use super::{SourceProperties, VideoSource};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct GstreamerSource {
    uri: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    fps: Option<f64>,
}

impl GstreamerSource {
    pub(crate) fn open(uri: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            uri
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build network pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("network pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let mut source = Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
            fps: None,
        };

        // Playing, then wait for preroll so an unreachable camera fails here
        // rather than on the first read.
        source
            .pipeline
            .set_state(gstreamer::State::Playing)
            .context("set network pipeline to Playing")?;
        let preroll = source
            .appsink
            .try_pull_preroll(gstreamer::ClockTime::from_seconds(FRAME_TIMEOUT.as_secs()));
        source.poll_bus()?;
        let preroll = preroll
            .ok_or_else(|| anyhow!("no video from {} within {:?}", uri, FRAME_TIMEOUT))?;
        source.fps = sample_fps(&preroll);

        log::info!("GstreamerSource: connected to {}", uri);
        Ok(source)
    }

    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("{} reached end of stream", self.uri)),
                _ => {}
            }
        }
        Ok(())
    }
}

impl VideoSource for GstreamerSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        self.poll_bus()?;
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(FRAME_TIMEOUT.as_millis() as u64))
            .ok_or_else(|| anyhow!("network stream stalled"))?;
        sample_to_image(&sample).map(Some)
    }

    fn properties(&self) -> SourceProperties {
        SourceProperties {
            fps: self.fps,
            total_frames: None,
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerSource: failed to stop {}: {}", self.uri, err);
        }
    }
}

fn sample_fps(sample: &gstreamer::Sample) -> Option<f64> {
    let info = gstreamer_video::VideoInfo::from_caps(sample.caps()?).ok()?;
    let fps = info.fps();
    (fps.numer() > 0 && fps.denom() > 0).then(|| f64::from(fps.numer()) / f64::from(fps.denom()))
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("buffer row is out of bounds")?,
        );
    }

    RgbImage::from_raw(width, height, pixels).ok_or_else(|| anyhow!("sample size mismatch"))
}
