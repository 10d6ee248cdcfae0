// Camera - one capture source and its recording state
//
// `got_image` runs on the driver's acquisition thread. Everything the session
// does (start, trigger, stop) happens on other threads and meets the capture
// thread under `state`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{CameraDriver, LensControl, Result, RoiControl, SensorFormat, SourceError, TriggerDetector};
use crate::config::Config;
use crate::container::ColorBalance;
use crate::imaging;
use crate::pipeline::{BufferKind, Frame};
use crate::recording::{
    ImageRecorder, ImageView, MetadataRecorder, Recorder, SourceInfo, StreamInfo, StreamRecorder, SummaryDoc,
};
use crate::recording::still::StillSettings;
use crate::recording::stream::StreamSettings;

/// Frames averaged for the effective framerate
const FPS_WINDOW: usize = 10;
const THUMBNAIL_QUALITY: u8 = 85;
const FRAME_POLL: Duration = Duration::from_millis(10);

/// Recorder settings for one session, derived from the node configuration
#[derive(Debug, Clone, Copy)]
pub struct RecordingSettings {
    pub still: StillSettings,
    pub stream: StreamSettings,
    pub missing_frame_threshold: f64,
}

impl RecordingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            still: StillSettings {
                format: config.image_format,
                queue_capacity: config.image_queue_capacity,
                workers: config.image_worker_count(),
            },
            stream: StreamSettings {
                format: config.stream_format,
                queue_capacity: config.stream_queue_capacity,
                writer_capacity: config.writer_queue_capacity,
                workers: config.encode_workers,
            },
            missing_frame_threshold: config.missing_frame_threshold,
        }
    }
}

struct CaptureState {
    start_ts: f64,
    last_ts: f64,
    fps_window: VecDeque<f64>,
    black_level: u32,
    /// Most recent frame while not recording
    preview: Option<Frame>,

    recording: bool,
    closing: bool,
    trigger: TriggerDetector,
    recorders: Vec<Box<dyn Recorder>>,
    frame_limit: Option<u64>,
    /// First recorded frame and its index in the primary recorder
    first_frame: Option<(Frame, u64)>,
    encoding_peak: u8,
    writing_peak: u8,
}

pub struct Camera {
    unique_id: String,
    driver: Box<dyn CameraDriver>,
    self_ref: Weak<Camera>,
    capturing: AtomicBool,
    using_hardware_sync: AtomicBool,
    image_counter: AtomicU64,
    balance: Mutex<ColorBalance>,
    state: Mutex<CaptureState>,
    /// Serializes concurrent stops so the second caller sees the finished summary
    stop_lock: Mutex<()>,
    last_summary: Mutex<Option<SummaryDoc>>,
}

impl Camera {
    pub fn new(driver: Box<dyn CameraDriver>, config: &Config) -> Arc<Self> {
        let unique_id = driver.unique_id();
        let trigger = TriggerDetector::new(config.trigger_gap_secs, config.trigger_timeout_secs);
        let balance = config.color_balance;

        Arc::new_cyclic(|self_ref| Self {
            unique_id,
            driver,
            self_ref: self_ref.clone(),
            capturing: AtomicBool::new(false),
            using_hardware_sync: AtomicBool::new(false),
            image_counter: AtomicU64::new(0),
            balance: Mutex::new(balance),
            state: Mutex::new(CaptureState {
                start_ts: 0.0,
                last_ts: 0.0,
                fps_window: VecDeque::with_capacity(FPS_WINDOW),
                black_level: 0,
                preview: None,
                recording: false,
                closing: false,
                trigger,
                recorders: Vec::new(),
                frame_limit: None,
                first_frame: None,
                encoding_peak: 0,
                writing_peak: 0,
            }),
            stop_lock: Mutex::new(()),
            last_summary: Mutex::new(None),
        })
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn format(&self) -> SensorFormat {
        self.driver.format()
    }

    pub fn is_audio_only(&self) -> bool {
        self.driver.is_audio_only()
    }

    pub fn is_valid(&self) -> bool {
        self.driver.is_valid()
    }

    // ========================================================================
    // Capture control
    // ========================================================================

    pub fn start_capture(&self) -> Result<()> {
        if self.capturing.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.is_valid() {
            return Err(SourceError::Invalid(self.unique_id.clone()));
        }
        self.driver.start_capture(self.self_ref.clone())?;
        self.capturing.store(true, Ordering::SeqCst);
        log::info!("[Camera] {} capturing", self.unique_id);
        Ok(())
    }

    pub fn stop_capture(&self) {
        if self.capturing.swap(false, Ordering::SeqCst) {
            self.driver.stop_capture();
            log::info!("[Camera] {} stopped capturing", self.unique_id);
        }
    }

    pub fn capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst) && self.is_valid()
    }

    /// Frames received since capture first started
    pub fn image_counter(&self) -> u64 {
        self.image_counter.load(Ordering::SeqCst)
    }

    /// Wait until a frame newer than the current one arrives. Returns false
    /// on timeout.
    pub fn block_until_next_frame(&self, timeout: Duration) -> bool {
        let start = self.image_counter();
        let deadline = Instant::now() + timeout;
        while self.image_counter() == start {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(FRAME_POLL);
        }
        true
    }

    // ========================================================================
    // Device settings
    // ========================================================================

    pub fn set_bitdepth(&self, bitcount: u8) -> bool {
        let changed = self.driver.set_bitdepth(bitcount);
        if changed {
            log::info!("[Camera] {} bit depth set to {}", self.unique_id, bitcount);
        }
        changed
    }

    pub fn using_hardware_sync(&self) -> bool {
        self.using_hardware_sync.load(Ordering::SeqCst)
    }

    pub fn set_hardware_sync(&self, enabled: bool, framerate: f64) {
        self.using_hardware_sync.store(enabled, Ordering::SeqCst);
        self.driver.set_hardware_sync(enabled, framerate);
    }

    /// Follow a new sync frequency if this camera is synchronized
    pub fn set_hardware_sync_freq(&self, framerate: f64) {
        if self.using_hardware_sync() {
            self.driver.set_hardware_sync(true, framerate);
        }
    }

    pub fn param_set(&self, name: &str, value: f64) -> Result<()> {
        self.driver.param_set(name, value)
    }

    pub fn param_get(&self, name: &str) -> Option<f64> {
        self.driver.param_get(name)
    }

    pub fn update_color_balance(&self, balance: ColorBalance) {
        *self.balance.lock() = balance;
    }

    pub fn color_balance(&self) -> ColorBalance {
        *self.balance.lock()
    }

    pub fn has_lens_control(&self) -> bool {
        self.driver.lens_control().is_some()
    }

    pub fn has_roi(&self) -> bool {
        self.driver.roi_control().is_some()
    }

    pub fn lens(&self) -> Result<&dyn LensControl> {
        self.driver.lens_control().ok_or(SourceError::Unsupported("lens control"))
    }

    pub fn roi(&self) -> Result<&dyn RoiControl> {
        self.driver.roi_control().ok_or(SourceError::Unsupported("region of interest"))
    }

    /// Bytes per second the sensor delivers at its nominal framerate
    pub fn bandwidth(&self) -> f64 {
        let format = self.format();
        let bytes_per_pixel = if format.bitcount > 8 { 2.0 } else { 1.0 };
        format.width as f64 * format.height as f64 * format.framerate * bytes_per_pixel
    }

    pub fn effective_fps(&self) -> f64 {
        let state = self.state.lock();
        if state.fps_window.is_empty() {
            0.0
        } else {
            state.fps_window.iter().sum::<f64>() / state.fps_window.len() as f64
        }
    }

    // ========================================================================
    // Frame intake
    // ========================================================================

    /// Driver callback, once per frame. `timestamp` is in seconds; anything
    /// non-positive is replaced by the wall clock.
    #[allow(clippy::too_many_arguments)]
    pub fn got_image(
        &self,
        pixels: &[u8],
        timestamp: f64,
        width: u32,
        height: u32,
        bitcount: u8,
        channels: u8,
        black_level: u32,
    ) {
        if channels != 1 {
            log::warn!("[Camera] {} delivered {} channels, only mono/bayer is supported", self.unique_id, channels);
            return;
        }

        let view = ImageView::new(pixels, width, height, bitcount);
        let mut frame_ts = if timestamp > 0.0 { timestamp } else { wall_clock() };
        let mut reached_limit = false;

        {
            let mut state = self.state.lock();
            if self.image_counter.load(Ordering::SeqCst) == 0 {
                state.start_ts = frame_ts;
                state.last_ts = 0.0;
            }
            frame_ts -= state.start_ts;
            let dt = frame_ts - state.last_ts;
            state.last_ts = frame_ts;
            state.black_level = black_level;

            if dt > 0.0 {
                if state.fps_window.len() == FPS_WINDOW {
                    state.fps_window.pop_front();
                }
                state.fps_window.push_back(1.0 / dt);
            }

            if state.recording && !state.recorders.is_empty() {
                let record = state.trigger.observe(dt);
                if record && !state.closing {
                    if state.first_frame.is_none() {
                        let index = state.recorders[0].frame_count();
                        state.first_frame = Some((view.to_frame(frame_ts, black_level), index));
                    }
                    for recorder in &state.recorders {
                        recorder.append(&view, frame_ts, black_level);
                    }
                    let encoding = state.recorders.iter().map(|r| r.buffers_used(BufferKind::Encoding)).max();
                    let writing = state.recorders.iter().map(|r| r.buffers_used(BufferKind::Writing)).max();
                    state.encoding_peak = state.encoding_peak.max(encoding.unwrap_or(0));
                    state.writing_peak = state.writing_peak.max(writing.unwrap_or(0));
                }
                if let Some(limit) = state.frame_limit {
                    reached_limit = state.recorders[0].frame_count() >= limit;
                }
            } else {
                state.preview = Some(view.to_frame(frame_ts, black_level));
            }
        }

        self.image_counter.fetch_add(1, Ordering::SeqCst);

        if reached_limit {
            self.stop_recording();
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    pub fn recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn waiting_for_trigger(&self) -> bool {
        self.state.lock().trigger.is_waiting()
    }

    fn stream_info(&self) -> StreamInfo {
        let format = self.format();
        StreamInfo {
            unique_id: self.unique_id.clone(),
            framerate: format.framerate,
            width: format.width,
            height: format.height,
            bitcount: format.bitcount,
            black_level: self.state.lock().black_level,
            bayer: format.bayer,
            balance: self.color_balance(),
        }
    }

    /// Arm a recording into `folders`. With a frame count the camera records
    /// that many stills and stops by itself; without one it streams until
    /// `stop_recording`. Output files are opened before this returns.
    pub fn start_recording(
        &self,
        folders: Vec<PathBuf>,
        wait_for_trigger: bool,
        frame_count: Option<u64>,
        settings: &RecordingSettings,
    ) -> Result<()> {
        if self.recording() {
            return Err(SourceError::AlreadyRecording(self.unique_id.clone()));
        }
        if !self.is_valid() {
            return Err(SourceError::Invalid(self.unique_id.clone()));
        }

        let info = self.stream_info();
        let frame_limit = frame_count.filter(|n| *n > 0);

        let (primary, filenames): (Box<dyn Recorder>, Vec<PathBuf>) = match frame_limit {
            Some(_) => {
                let recorder = ImageRecorder::new(info.clone(), folders.clone(), settings.still)?;
                (Box::new(recorder), folders.clone())
            }
            None => {
                let recorder = StreamRecorder::new(info.clone(), folders.clone(), settings.stream)?;
                let filenames = recorder.filenames().to_vec();
                (Box::new(recorder), filenames)
            }
        };
        let source: Weak<dyn SourceInfo> = self.self_ref.clone();
        let metadata = MetadataRecorder::new(info, folders, filenames, source, settings.missing_frame_threshold)?;

        *self.last_summary.lock() = None;

        let mut state = self.state.lock();
        state.recorders = vec![primary, Box::new(metadata)];
        state.frame_limit = frame_limit;
        state.first_frame = None;
        state.encoding_peak = 0;
        state.writing_peak = 0;
        state.closing = false;
        state.trigger.arm(wait_for_trigger);
        state.recording = true;

        log::info!(
            "[Camera] {} armed ({}, wait for trigger: {})",
            self.unique_id,
            match frame_limit {
                Some(n) => format!("{} still(s)", n),
                None => "stream".to_string(),
            },
            wait_for_trigger
        );
        Ok(())
    }

    pub fn remove_recording_hold(&self) {
        self.state.lock().trigger.release_hold();
    }

    pub fn software_trigger(&self) {
        self.state.lock().trigger.software_trigger();
        log::debug!("[Camera] {} software trigger", self.unique_id);
    }

    /// Close every recorder and build the summary. Safe to call from the
    /// capture thread and from the session concurrently.
    pub fn stop_recording(&self) {
        let _stopping = self.stop_lock.lock();

        let (recorders, first_frame, timed_out, peaks) = {
            let mut state = self.state.lock();
            if !state.recording {
                return;
            }
            state.closing = true;
            (
                std::mem::take(&mut state.recorders),
                state.first_frame.take(),
                state.trigger.timed_out(),
                (state.encoding_peak, state.writing_peak),
            )
        };

        // Recorders drain outside the lock; frames arriving meanwhile are ignored
        for recorder in &recorders {
            recorder.close();
        }

        let summary = self.summarize(&recorders, first_frame, timed_out, peaks);
        drop(recorders);
        *self.last_summary.lock() = Some(summary);

        let mut state = self.state.lock();
        state.trigger.reset();
        state.frame_limit = None;
        state.closing = false;
        state.recording = false;
        log::info!("[Camera] {} recording stopped", self.unique_id);
    }

    pub fn last_summary(&self) -> Option<SummaryDoc> {
        self.last_summary.lock().clone()
    }

    fn summarize(
        &self,
        recorders: &[Box<dyn Recorder>],
        first_frame: Option<(Frame, u64)>,
        timed_out: bool,
        (encoding_peak, writing_peak): (u8, u8),
    ) -> SummaryDoc {
        let format = self.format();
        let mut doc = SummaryDoc::new();
        doc.insert("unique_id".into(), json!(self.unique_id));

        for recorder in recorders {
            recorder.summarize(&mut doc);
        }

        doc.insert(
            "camera".into(),
            json!({
                "unique_id": self.unique_id,
                "model": self.driver.model(),
                "version": self.driver.version(),
                "effective_fps": self.effective_fps(),
                "framerate": format.framerate,
                "width": format.width,
                "height": format.height,
                "using_hardware_sync": self.using_hardware_sync(),
                "error_trigger_timeout": timed_out,
            }),
        );

        let params: serde_json::Map<String, Value> =
            self.params().into_iter().map(|(name, value)| (name, json!(value))).collect();
        doc.insert("camera_params".into(), Value::Object(params));
        doc.insert(
            "buffers".into(),
            json!({ "encoding_peak": encoding_peak, "writing_peak": writing_peak }),
        );

        let thumbnail = match first_frame {
            Some((frame, index)) => {
                doc.insert("thumbnail_index".into(), json!(index));
                Some(frame)
            }
            None => self.state.lock().preview.clone(),
        };
        if let Some(frame) = thumbnail {
            self.insert_thumbnails(&frame, &mut doc);
        }
        doc
    }

    fn insert_thumbnails(&self, frame: &Frame, doc: &mut SummaryDoc) {
        let preview = match imaging::preview(frame, self.format().bayer, self.color_balance()) {
            Ok(preview) => preview,
            Err(e) => {
                log::warn!("[Camera] {} thumbnail failed: {}", self.unique_id, e);
                return;
            }
        };
        let engine = base64::engine::general_purpose::STANDARD;

        if let Ok(jpeg) = imaging::encode_jpeg(&preview, THUMBNAIL_QUALITY) {
            doc.insert("jpeg_thumbnail".into(), json!(engine.encode(jpeg)));
        }
        let (overlay, clipped) = imaging::overexposure_overlay(&preview);
        if clipped > 0 {
            if let Ok(jpeg) = imaging::encode_jpeg(&overlay, THUMBNAIL_QUALITY) {
                doc.insert("jpeg_thumbnail_overexposed".into(), json!(engine.encode(jpeg)));
            }
        }
    }

    /// JPEG of the latest preview frame
    pub fn preview_jpeg(&self) -> Option<Vec<u8>> {
        let frame = self.state.lock().preview.clone()?;
        let preview = imaging::preview(&frame, self.format().bayer, self.color_balance()).ok()?;
        imaging::encode_jpeg(&preview, THUMBNAIL_QUALITY).ok()
    }
}

impl SourceInfo for Camera {
    fn model(&self) -> String {
        self.driver.model()
    }

    fn version(&self) -> String {
        self.driver.version()
    }

    fn using_hardware_sync(&self) -> bool {
        Camera::using_hardware_sync(self)
    }

    fn params(&self) -> Vec<(String, f64)> {
        self.driver
            .params()
            .into_iter()
            .filter_map(|(name, _)| self.driver.param_get(&name).map(|value| (name, value)))
            .collect()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.driver.stop_capture();
    }
}

fn wall_clock() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StillFormat;
    use crate::source::{SyntheticConfig, SyntheticDriver};

    fn config() -> Config {
        Config {
            image_workers: 1,
            ..Config::default()
        }
    }

    fn camera(config: &Config) -> Arc<Camera> {
        let driver = SyntheticDriver::new(SyntheticConfig {
            unique_id: Some("synth0".into()),
            width: 16,
            height: 8,
            bitcount: 8,
            framerate: 10.0,
            ..SyntheticConfig::default()
        });
        Camera::new(Box::new(driver), config)
    }

    fn feed(camera: &Camera, timestamps: &[f64]) {
        let pixels = vec![40u8; 16 * 8];
        for ts in timestamps {
            camera.got_image(&pixels, *ts, 16, 8, 8, 1, 2);
        }
    }

    #[test]
    fn timestamps_are_rebased_and_fps_tracked() {
        let cam = camera(&config());
        feed(&cam, &[100.0, 100.1, 100.2, 100.3]);
        assert_eq!(cam.image_counter(), 4);
        assert!((cam.effective_fps() - 10.0).abs() < 0.01);
    }

    #[test]
    fn preview_jpeg_follows_the_latest_frame() {
        let cam = camera(&config());
        assert!(cam.preview_jpeg().is_none());

        feed(&cam, &[0.5, 0.6]);
        let jpeg = cam.preview_jpeg().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn multi_channel_frames_are_rejected() {
        let cam = camera(&config());
        cam.got_image(&[0u8; 16 * 8 * 3], 1.0, 16, 8, 8, 3, 0);
        assert_eq!(cam.image_counter(), 0);
    }

    #[test]
    fn still_recording_stops_at_frame_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let cam = camera(&config);
        let settings = RecordingSettings::from_config(&config);

        cam.start_recording(vec![dir.path().to_path_buf()], false, Some(3), &settings).unwrap();
        assert!(cam.recording());
        assert!(matches!(
            cam.start_recording(vec![dir.path().to_path_buf()], false, Some(3), &settings),
            Err(SourceError::AlreadyRecording(_))
        ));

        feed(&cam, &[1.0, 1.1, 1.2, 1.3, 1.4]);
        assert!(!cam.recording());

        let summary = cam.last_summary().unwrap();
        assert_eq!(summary["unique_id"], "synth0");
        assert_eq!(summary["meta"]["frame_count"], 3);
        assert_eq!(summary["recorder"]["filenames"].as_array().unwrap().len(), 3);
        assert_eq!(summary["camera"]["error_trigger_timeout"], false);
        assert_eq!(summary["thumbnail_index"], 0);
        assert!(summary["jpeg_thumbnail"].as_str().is_some());
        assert!(dir.path().join(format!("synth0_0000.{}", StillFormat::Tif.extension())).exists());
    }

    #[test]
    fn held_recording_ignores_frames_until_triggered() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let cam = camera(&config);
        let settings = RecordingSettings::from_config(&config);

        cam.start_recording(vec![dir.path().to_path_buf()], true, None, &settings).unwrap();
        feed(&cam, &[1.0, 1.1, 1.2]);
        cam.remove_recording_hold();
        feed(&cam, &[1.3, 1.4]);
        assert!(cam.waiting_for_trigger());

        // 300 ms pause in the pulse train
        feed(&cam, &[1.7, 1.8, 1.9]);
        assert!(!cam.waiting_for_trigger());

        cam.stop_recording();
        cam.stop_recording();
        let summary = cam.last_summary().unwrap();
        assert_eq!(summary["meta"]["frame_count"], 3);
        assert_eq!(summary["recorder"]["dropped_frames"], 0);
    }

    #[test]
    fn software_trigger_skips_the_gap() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let cam = camera(&config);
        let settings = RecordingSettings::from_config(&config);

        cam.start_recording(vec![dir.path().to_path_buf()], true, None, &settings).unwrap();
        cam.software_trigger();
        feed(&cam, &[1.0, 1.1]);
        cam.stop_recording();
        assert_eq!(cam.last_summary().unwrap()["meta"]["frame_count"], 2);
    }

    #[test]
    fn missing_capabilities_are_unsupported() {
        let cam = camera(&config());
        assert!(!cam.has_lens_control());
        assert!(matches!(cam.roi(), Err(SourceError::Unsupported(_))));
    }

    #[test]
    fn bandwidth_uses_two_bytes_above_eight_bits() {
        let driver = SyntheticDriver::new(SyntheticConfig {
            width: 100,
            height: 10,
            bitcount: 12,
            framerate: 50.0,
            ..SyntheticConfig::default()
        });
        let cam = Camera::new(Box::new(driver), &config());
        assert_eq!(cam.bandwidth(), 100_000.0);
    }
}
