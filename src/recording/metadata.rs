// Metadata recorder - per-frame timestamps and a plain text session log
//
// Log layout: `Key: value` header lines, a blank line, then a
// `frame_index;timestamp_s;delta_ms` table with one row per frame.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Weak;

use parking_lot::Mutex;
use serde_json::json;

use super::{ImageView, Recorder, RecorderBase, RecorderError, Result, SourceInfo, StreamInfo, SummaryDoc};
use crate::container::missing_slots_between;

/// Number of leading frame deltas reported in the summary
const SUMMARY_DELTAS: usize = 19;

struct MetaState {
    base: RecorderBase,
    timestamps: Vec<f64>,
    missing_frames: u64,
    last_black_level: u32,
    written: bool,
}

pub struct MetadataRecorder {
    info: StreamInfo,
    folders: Vec<PathBuf>,
    log_path: PathBuf,
    /// Files of the recorder this log describes
    filenames: Vec<PathBuf>,
    source: Weak<dyn SourceInfo>,
    /// Gap in nominal intervals above which frames count as missing
    threshold: f64,
    state: Mutex<MetaState>,
}

impl MetadataRecorder {
    pub fn new(
        info: StreamInfo,
        folders: Vec<PathBuf>,
        filenames: Vec<PathBuf>,
        source: Weak<dyn SourceInfo>,
        threshold: f64,
    ) -> Result<Self> {
        let first = folders
            .first()
            .ok_or_else(|| RecorderError::NoFolders(info.unique_id.clone()))?;
        std::fs::create_dir_all(first)?;
        let log_path = first.join(format!("{}.txt", info.unique_id));

        Ok(Self {
            info,
            folders,
            log_path,
            filenames,
            source,
            threshold,
            state: Mutex::new(MetaState {
                base: RecorderBase::default(),
                timestamps: Vec::with_capacity(3600),
                missing_frames: 0,
                last_black_level: 0,
                written: false,
            }),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn missing_frames(&self) -> u64 {
        self.state.lock().missing_frames
    }

    fn interval(&self) -> f64 {
        if self.info.framerate > 0.0 { 1.0 / self.info.framerate } else { 0.0 }
    }

    fn write_log(&self, state: &MetaState) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(&self.log_path)?);
        let source = self.source.upgrade();
        let join = |paths: &[PathBuf]| {
            paths
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        writeln!(out, "Filename: {}", join(&self.filenames))?;
        writeln!(out, "Threads: {}", self.folders.len())?;
        writeln!(out, "Folder: {}", join(&self.folders))?;
        writeln!(out, "Framerate: {}", self.info.framerate)?;
        writeln!(out, "Machine: {}", sysinfo::System::host_name().unwrap_or_default())?;
        writeln!(out, "Model: {}", source.as_ref().map(|s| s.model()).unwrap_or_default())?;
        writeln!(out, "Width: {}", self.info.width)?;
        writeln!(out, "Height: {}", self.info.height)?;
        writeln!(out, "Bit Depth: {}", self.info.bitcount)?;
        writeln!(out, "Black Level: {}", state.last_black_level)?;
        writeln!(out, "FrameCount: {}", state.base.frame_count)?;
        writeln!(out, "MissingFrameCount: {}", state.missing_frames)?;
        match self.info.bayer {
            Some(pattern) => {
                let b = self.info.balance;
                writeln!(out, "ColorBayer: {}", pattern.as_str())?;
                writeln!(out, "ColorBalance: {}, {}, {}", b.k_r, b.k_g, b.k_b)?;
                writeln!(out, "ColorSpace: LinearRGB")?;
            }
            None => writeln!(out, "ColorSpace: Linear")?,
        }
        writeln!(out, "Version: {}", source.as_ref().map(|s| s.version()).unwrap_or_default())?;
        writeln!(
            out,
            "Using Sync: {}",
            source.as_ref().map(|s| s.using_hardware_sync()).unwrap_or(false)
        )?;
        if let Some(source) = &source {
            for (name, value) in source.params() {
                writeln!(out, "Param {}:{}", name, value)?;
            }
        }

        writeln!(out)?;
        writeln!(out, "frame_index;timestamp_s;delta_ms")?;
        let first = state.timestamps.first().copied().unwrap_or(0.0);
        let mut previous = first;
        for (i, ts) in state.timestamps.iter().enumerate() {
            writeln!(out, "{}; {}; {}", i, ts - first, (ts - previous) * 1000.0)?;
            previous = *ts;
        }
        out.flush()
    }
}

impl Recorder for MetadataRecorder {
    fn append(&self, _image: &ImageView<'_>, timestamp: f64, black_level: u32) {
        let mut state = self.state.lock();
        let previous = state.timestamps.last().copied();
        if !state.base.track(timestamp) {
            return;
        }

        if let Some(previous) = previous {
            let interval = self.interval();
            let dt = timestamp - previous;
            if interval > 0.0 && dt > interval * self.threshold {
                state.missing_frames += missing_slots_between(dt, interval).max(1);
            }
        }

        state.timestamps.push(timestamp);
        state.last_black_level = black_level;
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.base.closed = true;
        if state.written || state.timestamps.is_empty() {
            return;
        }
        state.written = true;

        match self.write_log(&state) {
            Ok(()) => log::info!("[Meta] Wrote {}", self.log_path.display()),
            Err(e) => log::error!("[Meta] Failed to write {}: {}", self.log_path.display(), e),
        }
    }

    fn summarize(&self, doc: &mut SummaryDoc) {
        let state = self.state.lock();
        let using_sync = self.source.upgrade().map(|s| s.using_hardware_sync()).unwrap_or(false);

        let mut root = json!({
            "meta_filename": self.log_path.to_string_lossy(),
            "threads": self.folders.len(),
            "frame_count": state.base.frame_count,
            "width": self.info.width,
            "height": self.info.height,
            "bitdepth": self.info.bitcount,
            "blacklevel": state.last_black_level,
            "duration": state.base.duration(),
            "using_sync": using_sync,
            "missing_frames": state.missing_frames,
        });

        if !state.timestamps.is_empty() {
            let deltas: Vec<f64> = state
                .timestamps
                .windows(2)
                .take(SUMMARY_DELTAS)
                .map(|w| w[1] - w[0])
                .collect();
            root["first_timedeltas"] = json!(deltas);
        }

        doc.insert("meta".into(), root);
    }

    fn frame_count(&self) -> u64 {
        self.state.lock().base.frame_count
    }
}

impl Drop for MetadataRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{BayerPattern, ColorBalance};
    use std::sync::Arc;

    struct FakeSource;

    impl SourceInfo for FakeSource {
        fn model(&self) -> String {
            "TestCam 3000".into()
        }
        fn version(&self) -> String {
            "fw 1.2".into()
        }
        fn using_hardware_sync(&self) -> bool {
            true
        }
        fn params(&self) -> Vec<(String, f64)> {
            vec![("exposure".into(), 5000.0)]
        }
    }

    fn info() -> StreamInfo {
        StreamInfo {
            unique_id: "cam3".into(),
            framerate: 10.0,
            width: 640,
            height: 480,
            bitcount: 10,
            black_level: 0,
            bayer: Some(BayerPattern::Rggb),
            balance: ColorBalance { k_r: 1.5, k_g: 1.0, k_b: 2.0 },
        }
    }

    fn view() -> ImageView<'static> {
        ImageView::new(&[], 640, 480, 10)
    }

    #[test]
    fn counts_missing_frames_from_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn SourceInfo> = Arc::new(FakeSource);
        let recorder =
            MetadataRecorder::new(info(), vec![dir.path().to_path_buf()], vec![], Arc::downgrade(&source), 1.5).unwrap();

        // 0.1 s interval; 0.3 s gap = 2 missing; 0.14 s is under threshold
        for ts in [0.0, 0.1, 0.4, 0.54, 0.64] {
            recorder.append(&view(), ts, 12);
        }
        assert_eq!(recorder.missing_frames(), 2);

        recorder.close();
        let mut doc = SummaryDoc::new();
        recorder.summarize(&mut doc);
        let meta = &doc["meta"];
        assert_eq!(meta["frame_count"], 5);
        assert_eq!(meta["missing_frames"], 2);
        assert_eq!(meta["blacklevel"], 12);
        assert_eq!(meta["using_sync"], true);
        assert_eq!(meta["first_timedeltas"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn threshold_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn SourceInfo> = Arc::new(FakeSource);
        let recorder =
            MetadataRecorder::new(info(), vec![dir.path().to_path_buf()], vec![], Arc::downgrade(&source), 5.0).unwrap();
        for ts in [0.0, 0.1, 0.4] {
            recorder.append(&view(), ts, 0);
        }
        assert_eq!(recorder.missing_frames(), 0);
    }

    #[test]
    fn log_has_header_and_frame_table() {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn SourceInfo> = Arc::new(FakeSource);
        let recorder = MetadataRecorder::new(
            info(),
            vec![dir.path().to_path_buf()],
            vec![dir.path().join("cam3.ava")],
            Arc::downgrade(&source),
            1.5,
        )
        .unwrap();
        for ts in [0.0, 0.1, 0.2] {
            recorder.append(&view(), ts, 4);
        }
        recorder.close();
        recorder.close();

        let text = std::fs::read_to_string(recorder.log_path()).unwrap();
        assert!(text.contains("Model: TestCam 3000"));
        assert!(text.contains("FrameCount: 3"));
        assert!(text.contains("MissingFrameCount: 0"));
        assert!(text.contains("ColorBayer: RGGB"));
        assert!(text.contains("Using Sync: true"));
        assert!(text.contains("Param exposure:5000"));

        let table: Vec<&str> = text.split("frame_index;timestamp_s;delta_ms\n").nth(1).unwrap().lines().collect();
        assert_eq!(table.len(), 3);
        assert!(table[0].starts_with("0; 0; 0"));
    }

    #[test]
    fn survives_a_dropped_source() {
        let dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn SourceInfo> = Arc::new(FakeSource);
        let weak = Arc::downgrade(&source);
        drop(source);

        let recorder = MetadataRecorder::new(info(), vec![dir.path().to_path_buf()], vec![], weak, 1.5).unwrap();
        recorder.append(&view(), 0.0, 0);
        recorder.close();
        let text = std::fs::read_to_string(recorder.log_path()).unwrap();
        assert!(text.contains("Model: \n"));
    }
}
