//! Generic video output for stream recordings
//!
//! Only built with the `video` feature. The write stage of a stream shard
//! pushes raw grayscale frames into a GStreamer pipeline:
//!
//! `appsrc ! videoconvert ! <encoder> ! matroskamux ! filesink`
//!
//! The encoder is the first element found from a preference list, hardware
//! AV1 first, software VP8 last.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use super::{RecorderError, Result, StreamInfo};
use crate::pipeline::{FrameSink, FrameTag};

/// Encoders in order of preference
const ENCODERS: &[&str] = &["nvav1enc", "vaav1enc", "qsvav1enc", "av1enc", "vp8enc"];

static GST_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initialize GStreamer once per process
pub fn init_gstreamer() -> Result<()> {
    GST_INIT
        .get_or_init(|| match gst::init() {
            Ok(()) => {
                let (major, minor, micro, _) = gst::version();
                log::info!("GStreamer {}.{}.{} initialized", major, minor, micro);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                Err(e.to_string())
            }
        })
        .clone()
        .map_err(RecorderError::NotAvailable)
}

/// First available encoder element
pub fn detect_encoder() -> Option<&'static str> {
    ENCODERS
        .iter()
        .copied()
        .find(|name| gst::ElementFactory::find(name).is_some())
}

pub struct VideoSink {
    path: PathBuf,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    finished: bool,
}

impl VideoSink {
    pub fn create(path: &Path, info: &StreamInfo, interval: f64) -> Result<Self> {
        init_gstreamer()?;
        let encoder_name = detect_encoder()
            .ok_or_else(|| RecorderError::NotAvailable("no video encoder element installed".into()))?;

        let fps = if interval > 0.0 { 1.0 / interval } else { info.framerate.max(1.0) };
        let format = if info.bitcount > 8 { "GRAY16_LE" } else { "GRAY8" };
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", format)
            .field("width", info.width as i32)
            .field("height", info.height as i32)
            .field("framerate", gst::Fraction::new((fps * 1000.0).round() as i32, 1000))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(false)
            .build();

        let make = |name: &str| {
            gst::ElementFactory::make(name)
                .build()
                .map_err(|e| RecorderError::NotAvailable(format!("Failed to create {}: {}", name, e)))
        };
        let convert = make("videoconvert")?;
        let encoder = make(encoder_name)?;
        let muxer = make("matroskamux")?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("sync", false)
            .build()
            .map_err(|e| RecorderError::NotAvailable(format!("Failed to create filesink: {}", e)))?;

        let pipeline = gst::Pipeline::new();
        let elements = [appsrc.upcast_ref(), &convert, &encoder, &muxer, &filesink];
        pipeline
            .add_many(elements)
            .map_err(|e| RecorderError::NotAvailable(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many(elements)
            .map_err(|e| RecorderError::NotAvailable(format!("Failed to link elements: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| RecorderError::NotAvailable(format!("Failed to start pipeline: {:?}", e)))?;

        log::info!("[Video] Encoding {} with {}", path.display(), encoder_name);

        Ok(Self {
            path: path.to_path_buf(),
            pipeline,
            appsrc,
            finished: false,
        })
    }
}

impl FrameSink<Vec<u8>> for VideoSink {
    fn write(&mut self, tag: FrameTag, item: Vec<u8>) -> io::Result<u64> {
        let len = item.len() as u64;
        let mut buffer = gst::Buffer::from_mut_slice(item);
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds((tag.timestamp.max(0.0) * 1e9) as u64));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("push_buffer: {:?}", e)))?;
        Ok(len)
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if let Err(e) = self.appsrc.end_of_stream() {
            log::warn!("[Video] EOS send failed: {:?}", e);
        }

        let mut result = Ok(());
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(30)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        result = Err(io::Error::new(
                            io::ErrorKind::Other,
                            format!("{} ({:?})", err.error(), err.debug()),
                        ));
                        break;
                    }
                    _ => {}
                }
            }
        }

        let _ = self.pipeline.set_state(gst::State::Null);
        log::info!("[Video] Finished {}", self.path.display());
        result
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}
