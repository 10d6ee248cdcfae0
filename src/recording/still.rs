// Still image recorder - one developed TIFF (or RAW) per frame
//
// Frames are developed in parallel and written in whatever order they finish;
// every frame has its own file so ordering does not matter. Intake blocks
// when full: a still capture never loses a frame.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{file_summary, BufferKind, ImageView, Recorder, RecorderBase, RecorderError, Result, StreamInfo, SummaryDoc};
use crate::config::StillFormat;
use crate::container::ContainerHeader;
use crate::imaging;
use crate::pipeline::{
    Frame, FrameSink, FrameTag, Pipeline, PipelineConfig, PipelineError, PushMode, PushOutcome, TransformFn, WriteOrder,
};

/// Pipeline sizing for a still recorder
#[derive(Debug, Clone, Copy)]
pub struct StillSettings {
    pub format: StillFormat,
    pub queue_capacity: usize,
    pub workers: usize,
}

/// File name of still `index`, dealt round-robin over `folders`
pub fn still_path(folders: &[PathBuf], unique_id: &str, index: u64, format: StillFormat) -> PathBuf {
    let folder = &folders[(index % folders.len() as u64) as usize];
    folder.join(format!("{}_{:04}.{}", unique_id, index, format.extension()))
}

struct StillFileSink {
    folders: Vec<PathBuf>,
    unique_id: String,
    format: StillFormat,
    written: Vec<PathBuf>,
}

impl FrameSink<Vec<u8>> for StillFileSink {
    fn write(&mut self, tag: FrameTag, item: Vec<u8>) -> std::io::Result<u64> {
        let path = still_path(&self.folders, &self.unique_id, tag.seq, self.format);
        std::fs::write(&path, &item)?;
        self.written.push(path);
        Ok(item.len() as u64)
    }

    fn outputs(&self) -> Vec<PathBuf> {
        self.written.clone()
    }
}

struct StillState {
    base: RecorderBase,
    filenames: Vec<PathBuf>,
}

pub struct ImageRecorder {
    info: StreamInfo,
    folders: Vec<PathBuf>,
    format: StillFormat,
    pipeline: Pipeline<Vec<u8>>,
    state: Mutex<StillState>,
}

impl ImageRecorder {
    pub fn new(info: StreamInfo, folders: Vec<PathBuf>, settings: StillSettings) -> Result<Self> {
        if folders.is_empty() {
            return Err(RecorderError::NoFolders(info.unique_id.clone()));
        }
        for folder in &folders {
            std::fs::create_dir_all(folder)?;
        }

        let transform = still_transform(&info, settings.format);
        let sink = StillFileSink {
            folders: folders.clone(),
            unique_id: info.unique_id.clone(),
            format: settings.format,
            written: Vec::new(),
        };

        let pipeline = Pipeline::new(
            PipelineConfig {
                name: format!("still-{}", info.unique_id),
                workers: settings.workers,
                intake_capacity: settings.queue_capacity,
                output_capacity: settings.queue_capacity,
                push_mode: PushMode::Blocking,
                write_order: WriteOrder::Completion,
            },
            transform,
            Box::new(sink),
        )?;

        log::info!(
            "[Still] Recording {} as {} into {} folder(s)",
            info.unique_id,
            settings.format.extension(),
            folders.len()
        );

        Ok(Self {
            info,
            folders,
            format: settings.format,
            pipeline,
            state: Mutex::new(StillState {
                base: RecorderBase::default(),
                filenames: Vec::new(),
            }),
        })
    }
}

fn still_transform(info: &StreamInfo, format: StillFormat) -> TransformFn<Vec<u8>> {
    let bayer = info.bayer;
    let balance = info.balance;
    Arc::new(move |frame: Frame| -> crate::pipeline::Result<Vec<u8>> {
        let encode = |frame: &Frame| -> imaging::Result<Vec<u8>> {
            match format {
                StillFormat::Tif => imaging::encode_tiff(&imaging::develop(frame, bayer, balance)?),
                StillFormat::Raw => {
                    let mut bytes = imaging::encode_tiff(&imaging::raw_image(frame)?)?;
                    let header =
                        ContainerHeader::new(frame.width, frame.height, frame.bitcount, frame.black_level, bayer, balance);
                    bytes.extend_from_slice(&header.raw_footer());
                    Ok(bytes)
                }
            }
        };
        encode(&frame).map_err(|e| PipelineError::Transform(e.to_string()))
    })
}

impl Recorder for ImageRecorder {
    fn append(&self, image: &ImageView<'_>, timestamp: f64, black_level: u32) {
        let mut state = self.state.lock();
        if !state.base.track(timestamp) {
            return;
        }
        if let PushOutcome::Accepted(seq) = self.pipeline.push(image.to_frame(timestamp, black_level)) {
            let path = still_path(&self.folders, &self.info.unique_id, seq, self.format);
            state.filenames.push(path);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.base.closed {
            return;
        }
        state.base.closed = true;
        let report = self.pipeline.close();
        if let Some(error) = report.error {
            log::error!("[Still] {}: {}", self.info.unique_id, error);
        }
        // Files that failed to write are not part of the recording
        state.filenames.retain(|f| report.outputs.contains(f));
        log::info!("[Still] {} closed after {} frames", self.info.unique_id, state.base.frame_count);
    }

    fn summarize(&self, doc: &mut SummaryDoc) {
        let state = self.state.lock();
        let dropped = self.pipeline.stats().lost();
        doc.insert(
            "recorder".into(),
            file_summary(&state.filenames, &self.info, &state.base, dropped),
        );
    }

    fn buffers_used(&self, kind: BufferKind) -> u8 {
        self.pipeline.buffers_used(kind)
    }

    fn frame_count(&self) -> u64 {
        self.state.lock().base.frame_count
    }
}

impl Drop for ImageRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
