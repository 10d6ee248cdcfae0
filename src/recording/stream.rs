// Stream recorder - continuous recording sharded across drives
//
// Every frame gets a slot on the nominal frame grid from its timestamp. Slot s
// goes to shard s mod N at position s / N in that shard's index, so a frame the
// source never delivered leaves a zero in exactly one shard. Each shard is its
// own pipeline writing its own file, so one slow drive only backs up its own
// intake. Intake never blocks the capture thread: a full queue drops the frame
// and counts it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use super::{file_summary, BufferKind, ImageView, Recorder, RecorderBase, RecorderError, Result, StreamInfo, SummaryDoc};
use crate::config::StreamFormat;
use crate::container::{compress_frame, frame_slot, ContainerHeader, ContainerWriter};
use crate::pipeline::{Frame, FrameSink, Pipeline, PipelineConfig, PushMode, TransformFn, WriteOrder};

/// Pipeline sizing for a stream recorder
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub format: StreamFormat,
    pub queue_capacity: usize,
    pub writer_capacity: usize,
    pub workers: usize,
}

/// Output file of one shard
pub fn shard_path(folder: &Path, unique_id: &str, shard: usize, shards: usize, format: StreamFormat) -> PathBuf {
    if shards == 1 {
        folder.join(format!("{}.{}", unique_id, format.extension()))
    } else {
        folder.join(format!("{}_{:03}.{}", unique_id, shard, format.extension()))
    }
}

pub struct StreamRecorder {
    info: StreamInfo,
    shards: Vec<Pipeline<Vec<u8>>>,
    filenames: Vec<PathBuf>,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    base: RecorderBase,
    /// Grid slot of the last appended frame
    last_slot: Option<u64>,
}

impl StreamRecorder {
    /// Open one output per folder and start a pipeline for each. Every file is
    /// created before any stage thread starts.
    pub fn new(info: StreamInfo, folders: Vec<PathBuf>, settings: StreamSettings) -> Result<Self> {
        if folders.is_empty() {
            return Err(RecorderError::NoFolders(info.unique_id.clone()));
        }

        let count = folders.len();
        // Frame duration within one shard's video, which sees every Nth frame
        let interval = if info.framerate > 0.0 { count as f64 / info.framerate } else { 0.0 };

        let mut sinks = Vec::with_capacity(count);
        let mut filenames = Vec::with_capacity(count);
        for (index, folder) in folders.iter().enumerate() {
            std::fs::create_dir_all(folder)?;
            let path = shard_path(folder, &info.unique_id, index, count, settings.format);
            sinks.push(open_sink(settings.format, &path, &info, interval)?);
            filenames.push(path);
        }

        let (transform, workers) = match settings.format {
            StreamFormat::Container => (compress_transform(), settings.workers),
            StreamFormat::Video => (passthrough_transform(), 1),
        };

        let mut shards = Vec::with_capacity(count);
        for (index, sink) in sinks.into_iter().enumerate() {
            let pipeline = Pipeline::new(
                PipelineConfig {
                    name: format!("stream-{}-{}", info.unique_id, index),
                    workers,
                    intake_capacity: settings.queue_capacity,
                    output_capacity: settings.writer_capacity,
                    push_mode: PushMode::DropWhenFull,
                    write_order: WriteOrder::Sequential,
                },
                transform.clone(),
                sink,
            )?;
            shards.push(pipeline);
        }

        log::info!(
            "[Stream] Recording {} ({}x{}, {} bit, {} fps) on {} shard(s)",
            info.unique_id,
            info.width,
            info.height,
            info.bitcount,
            info.framerate,
            count
        );

        Ok(Self {
            info,
            shards,
            filenames,
            state: Mutex::new(StreamState::default()),
        })
    }

    pub fn filenames(&self) -> &[PathBuf] {
        &self.filenames
    }

    fn dropped_frames(&self) -> u64 {
        self.shards.iter().map(|s| s.stats().lost()).sum()
    }
}

fn open_sink(
    format: StreamFormat,
    path: &Path,
    info: &StreamInfo,
    interval: f64,
) -> Result<Box<dyn FrameSink<Vec<u8>>>> {
    match format {
        StreamFormat::Container => {
            let header = ContainerHeader::new(info.width, info.height, info.bitcount, info.black_level, info.bayer, info.balance);
            Ok(Box::new(ContainerWriter::create(path, header)?))
        }
        #[cfg(feature = "video")]
        StreamFormat::Video => Ok(Box::new(super::video::VideoSink::create(path, info, interval)?)),
        #[cfg(not(feature = "video"))]
        StreamFormat::Video => {
            let _ = (path, info, interval);
            Err(RecorderError::NotAvailable(
                "video output requires building with the `video` feature".into(),
            ))
        }
    }
}

fn compress_transform() -> TransformFn<Vec<u8>> {
    Arc::new(|frame: Frame| -> crate::pipeline::Result<Vec<u8>> { Ok(compress_frame(&frame.pixels)) })
}

fn passthrough_transform() -> TransformFn<Vec<u8>> {
    Arc::new(|frame: Frame| -> crate::pipeline::Result<Vec<u8>> { Ok(frame.pixels) })
}

impl Recorder for StreamRecorder {
    fn append(&self, image: &ImageView<'_>, timestamp: f64, black_level: u32) {
        let mut state = self.state.lock();
        if !state.base.track(timestamp) {
            return;
        }
        // The first appended frame is slot 0
        let slot = frame_slot(timestamp - state.base.first_ts, self.info.framerate, state.last_slot);
        state.last_slot = Some(slot);

        let count = self.shards.len() as u64;
        let shard = &self.shards[(slot % count) as usize];
        shard.push(image.to_frame(timestamp, black_level).with_slot(slot / count));
    }

    fn close(&self) {
        let mut state = self.state.lock();
        let base = &mut state.base;
        if base.closed {
            return;
        }
        base.closed = true;
        for shard in &self.shards {
            let report = shard.close();
            if let Some(error) = report.error {
                log::error!("[Stream] {} ({}): {}", self.info.unique_id, shard.name(), error);
            }
        }
        log::info!(
            "[Stream] {} closed: {} frames, {} dropped",
            self.info.unique_id,
            base.frame_count,
            self.dropped_frames()
        );
    }

    fn summarize(&self, doc: &mut SummaryDoc) {
        let state = self.state.lock();
        let mut root = file_summary(&self.filenames, &self.info, &state.base, self.dropped_frames());
        root["shards"] = json!(self.shards.iter().map(|s| s.stats()).collect::<Vec<_>>());
        doc.insert("recorder".into(), root);
    }

    fn buffers_used(&self, kind: BufferKind) -> u8 {
        self.shards.iter().map(|s| s.buffers_used(kind)).max().unwrap_or(0)
    }

    fn frame_count(&self) -> u64 {
        self.state.lock().base.frame_count
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ColorBalance, ContainerReader};

    fn info(framerate: f64) -> StreamInfo {
        StreamInfo {
            unique_id: "cam".into(),
            framerate,
            width: 8,
            height: 4,
            bitcount: 12,
            black_level: 16,
            bayer: None,
            balance: ColorBalance::default(),
        }
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            format: StreamFormat::Container,
            queue_capacity: 64,
            writer_capacity: 8,
            workers: 2,
        }
    }

    #[test]
    fn frames_alternate_between_shards() {
        let dir = tempfile::tempdir().unwrap();
        let folders = vec![dir.path().join("a"), dir.path().join("b")];
        let recorder = StreamRecorder::new(info(10.0), folders.clone(), settings()).unwrap();

        let pixels: Vec<u8> = (0..64).collect();
        for i in 0..6 {
            recorder.append(&ImageView::new(&pixels, 8, 4, 12), i as f64 * 0.1, 16);
        }
        recorder.close();

        for folder in &folders {
            let name = recorder
                .filenames()
                .iter()
                .find(|f| f.starts_with(folder))
                .unwrap()
                .clone();
            let mut reader = ContainerReader::open(&name).unwrap();
            assert_eq!(reader.frame_count(), 3);
            assert_eq!(reader.header().black_level, 16);
            assert_eq!(reader.read_frame(2).unwrap().unwrap(), pixels);
        }
    }

    /// Append 10 fps frames at the given grid positions, return
    /// (total index slots, zero slots) over every shard file
    fn record_positions(shards: usize, positions: &[u64]) -> (usize, usize) {
        let dir = tempfile::tempdir().unwrap();
        let folders = (0..shards).map(|i| dir.path().join(format!("d{}", i))).collect();
        let recorder = StreamRecorder::new(info(10.0), folders, settings()).unwrap();

        let pixels = vec![0u8; 64];
        for &i in positions {
            recorder.append(&ImageView::new(&pixels, 8, 4, 12), i as f64 * 0.1, 0);
        }
        recorder.close();

        let mut total = 0;
        let mut zeros = 0;
        for file in recorder.filenames() {
            let reader = ContainerReader::open(file).unwrap();
            total += reader.frame_count();
            zeros += reader.missing_slots().len();
        }
        (total, zeros)
    }

    #[test]
    fn shard_interval_accounts_for_interleaving() {
        let dir = tempfile::tempdir().unwrap();
        let folders = vec![dir.path().join("a"), dir.path().join("b")];
        let recorder = StreamRecorder::new(info(10.0), folders, settings()).unwrap();

        let pixels = vec![0u8; 64];
        // Frame 4 (t=0.4) never arrives: shard a sees slots 0, 2 and 6
        for ts in [0.0, 0.1, 0.2, 0.3, 0.5, 0.6, 0.7] {
            recorder.append(&ImageView::new(&pixels, 8, 4, 12), ts, 0);
        }
        recorder.close();

        let mut a = ContainerReader::open(&recorder.filenames()[0]).unwrap();
        assert_eq!(a.index().len(), 4);
        assert_eq!(a.missing_slots(), vec![2]);
        assert!(a.read_frame(3).unwrap().is_some());

        let b = ContainerReader::open(&recorder.filenames()[1]).unwrap();
        assert_eq!(b.index().len(), 4);
        assert!(b.missing_slots().is_empty());
    }

    #[test]
    fn one_missing_frame_leaves_one_zero_whatever_the_shard_count() {
        let positions: Vec<u64> = (0..12).filter(|&i| i != 4).collect();
        for shards in [1, 2, 3, 4] {
            assert_eq!(record_positions(shards, &positions), (12, 1), "{} shard(s)", shards);
        }
    }

    #[test]
    fn missing_frame_lands_in_its_own_shard() {
        let dir = tempfile::tempdir().unwrap();
        let folders: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("d{}", i))).collect();
        let recorder = StreamRecorder::new(info(10.0), folders, settings()).unwrap();

        let pixels = vec![0u8; 64];
        for i in (0..12).filter(|&i| i != 4) {
            recorder.append(&ImageView::new(&pixels, 8, 4, 12), i as f64 * 0.1, 0);
        }
        recorder.close();

        // Slot 4 belongs to shard 1, position 1
        let missing: Vec<Vec<usize>> = recorder
            .filenames()
            .iter()
            .map(|f| ContainerReader::open(f).unwrap().missing_slots())
            .collect();
        assert_eq!(missing, vec![vec![], vec![1], vec![]]);
    }

    #[test]
    fn unwritable_folder_fails_before_recording() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(StreamRecorder::new(info(10.0), vec![file], settings()).is_err());
    }

    #[cfg(not(feature = "video"))]
    #[test]
    fn video_output_needs_feature() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings();
        settings.format = StreamFormat::Video;
        let result = StreamRecorder::new(info(10.0), vec![dir.path().to_path_buf()], settings);
        assert!(matches!(result, Err(RecorderError::NotAvailable(_))));
    }
}
