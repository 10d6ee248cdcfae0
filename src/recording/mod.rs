// Recorders - per-source, per-session writers fed from the capture thread

pub mod still;
pub mod metadata;
pub mod stream;
#[cfg(feature = "video")]
pub mod video;

pub use still::ImageRecorder;
pub use metadata::MetadataRecorder;
pub use stream::StreamRecorder;

pub use crate::pipeline::BufferKind;

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::container::{BayerPattern, ColorBalance, ContainerError};
use crate::pipeline::{Frame, PipelineError};

/// Nested key/value summary merged from every recorder of a source
pub type SummaryDoc = serde_json::Map<String, Value>;

/// Error type for recorder setup. Per-frame failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("No output folder for {0}")]
    NoFolders(String),

    #[error("Output not available: {0}")]
    NotAvailable(String),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

/// Borrowed view of a driver buffer. The driver reuses the buffer after the
/// callback returns, so recorders copy what they keep.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub bitcount: u8,
}

impl<'a> ImageView<'a> {
    pub fn new(pixels: &'a [u8], width: u32, height: u32, bitcount: u8) -> Self {
        Self { pixels, width, height, bitcount }
    }

    /// Owned snapshot for the pipeline
    pub fn to_frame(&self, timestamp: f64, black_level: u32) -> Frame {
        Frame::new(self.pixels.to_vec(), self.width, self.height, self.bitcount, timestamp, black_level)
    }
}

/// What a recorder needs to know about the stream it records
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub unique_id: String,
    pub framerate: f64,
    pub width: u32,
    pub height: u32,
    pub bitcount: u8,
    pub black_level: u32,
    pub bayer: Option<BayerPattern>,
    pub balance: ColorBalance,
}

impl StreamInfo {
    pub fn bytes_per_pixel(&self) -> usize {
        if self.bitcount > 8 { 2 } else { 1 }
    }

    /// Uncompressed size of one frame as the sensor delivers it
    pub fn frame_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.bitcount as u64 / 8
    }
}

/// Device details the metadata log asks of its source
pub trait SourceInfo: Send + Sync {
    fn model(&self) -> String;
    fn version(&self) -> String;
    fn using_hardware_sync(&self) -> bool;
    fn params(&self) -> Vec<(String, f64)>;
}

/// Common recorder interface
///
/// `append` runs on the capture thread. After `close` every further `append`
/// is ignored, and `close` itself may be called any number of times.
pub trait Recorder: Send + Sync {
    fn append(&self, image: &ImageView<'_>, timestamp: f64, black_level: u32);

    fn close(&self);

    fn summarize(&self, doc: &mut SummaryDoc);

    /// Backlog of a pipeline stage, 0-100
    fn buffers_used(&self, _kind: BufferKind) -> u8 {
        0
    }

    fn frame_count(&self) -> u64;
}

/// Bookkeeping shared by every recorder, kept under the recorder's own lock
#[derive(Debug, Default, Clone)]
pub struct RecorderBase {
    pub closed: bool,
    pub frame_count: u64,
    pub first_ts: f64,
    pub last_ts: f64,
}

impl RecorderBase {
    /// Account for a new frame. Returns `false` once closed.
    pub fn track(&mut self, timestamp: f64) -> bool {
        if self.closed {
            return false;
        }
        if self.frame_count == 0 {
            self.first_ts = timestamp;
        }
        self.last_ts = timestamp;
        self.frame_count += 1;
        true
    }

    pub fn duration(&self) -> f64 {
        self.last_ts - self.first_ts
    }
}

/// `recorder` section shared by the file-producing recorders
pub(crate) fn file_summary(
    filenames: &[PathBuf],
    info: &StreamInfo,
    base: &RecorderBase,
    dropped_frames: u64,
) -> Value {
    let total_size: u64 = filenames
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();

    let raw_size = info.frame_size() * base.frame_count;
    let compression_ratio = if total_size > 0 {
        raw_size as f64 / total_size as f64
    } else {
        0.0
    };

    let mut root = json!({
        "filenames": filenames.iter().map(|f| f.to_string_lossy().to_string()).collect::<Vec<_>>(),
        "total_size": total_size,
        "dropped_frames": dropped_frames,
        "compression_ratio": compression_ratio,
    });

    let duration = base.duration();
    if duration > 0.0 {
        root["bandwidth"] = json!(total_size as f64 / duration / 1024.0 / 1024.0);
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_ignores_frames_after_close() {
        let mut base = RecorderBase::default();
        assert!(base.track(1.0));
        assert!(base.track(1.5));
        base.closed = true;
        assert!(!base.track(2.0));
        assert_eq!(base.frame_count, 2);
        assert_eq!(base.duration(), 0.5);
    }

    #[test]
    fn file_summary_reports_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        let info = StreamInfo {
            unique_id: "cam".into(),
            framerate: 10.0,
            width: 100,
            height: 10,
            bitcount: 8,
            black_level: 0,
            bayer: None,
            balance: ColorBalance::default(),
        };
        let base = RecorderBase { closed: true, frame_count: 4, first_ts: 0.0, last_ts: 2.0 };
        let summary = file_summary(&[path], &info, &base, 3);

        assert_eq!(summary["total_size"], 1000);
        assert_eq!(summary["dropped_frames"], 3);
        assert_eq!(summary["compression_ratio"], 4.0);
        assert!(summary["bandwidth"].as_f64().unwrap() > 0.0);
    }
}
