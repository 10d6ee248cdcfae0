// Capture node - drives recording sessions across every registered camera
//
// Transitions are serialized by the `transition` lock, which is held across
// I/O for a whole session. Queries never take it: the session state, drives
// and last summary live under `status` and the camera lists under `devices`,
// both only ever held to copy or mutate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::allocation::{allocate_single, allocate_stream};
use super::drives::DrivePool;
use super::state::SessionState;
use super::sync::NodeContext;
use super::{Result, SessionError};
use crate::config::{Config, StillFormat};
use crate::container::ColorBalance;
use crate::source::{Camera, CameraDriver, RecordingSettings};

#[derive(Default)]
struct Devices {
    cameras: Vec<Arc<Camera>>,
    /// Fixed between a Prepare1 and the matching Finalize/Stop
    recording: Vec<Arc<Camera>>,
}

struct Status {
    state: SessionState,
    drives: DrivePool,
    last_summary: Option<Value>,
}

/// Owned by whichever thread is running a transition
struct Control {
    frame_count: u64,
}

pub struct CaptureNode {
    context: NodeContext,
    config: Mutex<Config>,
    devices: Mutex<Devices>,
    status: Mutex<Status>,
    transition: Mutex<Control>,
    sync_active: AtomicBool,
}

impl CaptureNode {
    /// Benchmark the configured recording folders and enter preview
    pub fn new(config: Config, context: NodeContext) -> Self {
        let drives = DrivePool::scan(
            &config.recording_folders,
            config.min_drive_speed_mb_s,
            config.drive_benchmark_mb,
        );
        Self::with_drives(config, context, drives)
    }

    pub fn with_drives(config: Config, context: NodeContext, drives: DrivePool) -> Self {
        if drives.is_empty() {
            log::warn!("[Node] No usable recording drive");
        }
        let node = Self {
            context,
            config: Mutex::new(config),
            devices: Mutex::new(Devices::default()),
            status: Mutex::new(Status {
                state: SessionState::Preview,
                drives,
                last_summary: None,
            }),
            transition: Mutex::new(Control { frame_count: 1 }),
            sync_active: AtomicBool::new(false),
        };
        node.start_preview_sync();
        node
    }

    pub fn config(&self) -> Config {
        self.config.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().state
    }

    pub fn drives(&self) -> DrivePool {
        self.status.lock().drives.clone()
    }

    /// Re-run the drive benchmark, e.g. after the folder list changed
    pub fn refresh_drives(&self) {
        let config = self.config();
        let drives = DrivePool::scan(
            &config.recording_folders,
            config.min_drive_speed_mb_s,
            config.drive_benchmark_mb,
        );
        self.status.lock().drives = drives;
    }

    pub fn last_summary(&self) -> Option<Value> {
        self.status.lock().last_summary.clone()
    }

    pub fn sync_port(&self) -> Option<String> {
        self.context.sync.as_ref().map(|s| s.port())
    }

    pub fn generic_message(&self, message: &str) {
        self.context.notify_message(message);
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Wrap a driver in a camera, set the preview bit depth and start capture
    pub fn add_driver(&self, driver: Box<dyn CameraDriver>) -> Result<Arc<Camera>> {
        let camera = Camera::new(driver, &self.config.lock());
        self.add_camera(camera.clone())?;
        Ok(camera)
    }

    pub fn add_camera(&self, camera: Arc<Camera>) -> Result<()> {
        if self.camera_by_id(camera.unique_id()).is_some() {
            return Err(SessionError::DuplicateCamera(camera.unique_id().to_string()));
        }
        let bitdepth = self.config.lock().bitdepth_default;
        camera.set_bitdepth(bitdepth);
        camera.start_capture()?;

        let format = camera.format();
        log::info!(
            "[Node] Added camera {} ({}x{}, {} bit, {} fps)",
            camera.unique_id(),
            format.width,
            format.height,
            format.bitcount,
            format.framerate
        );
        self.devices.lock().cameras.push(camera);
        Ok(())
    }

    pub fn camera_by_id(&self, unique_id: &str) -> Option<Arc<Camera>> {
        self.devices
            .lock()
            .cameras
            .iter()
            .find(|c| c.unique_id() == unique_id)
            .cloned()
    }

    pub fn camera_list(&self) -> Vec<Arc<Camera>> {
        self.devices.lock().cameras.clone()
    }

    /// Cameras of the current recording, empty outside a session
    pub fn recording_cameras(&self) -> Vec<Arc<Camera>> {
        self.devices.lock().recording.clone()
    }

    /// Drop disconnected cameras. A camera of the active recording set stays
    /// until its session ends. Returns the removed ids.
    pub fn remove_invalid_devices(&self) -> Vec<String> {
        let removed: Vec<Arc<Camera>> = {
            let mut devices = self.devices.lock();
            let Devices { cameras, recording } = &mut *devices;
            let (invalid, valid): (Vec<_>, Vec<_>) = cameras
                .drain(..)
                .partition(|c| !c.is_valid() && !recording.iter().any(|r| Arc::ptr_eq(r, c)));
            *cameras = valid;
            invalid
        };
        for camera in &removed {
            log::info!("[Node] Removing disconnected camera {}", camera.unique_id());
            camera.stop_capture();
        }
        removed.iter().map(|c| c.unique_id().to_string()).collect()
    }

    /// True in preview with an empty recording set and a usable drive. Never
    /// waits for a session in flight.
    pub fn can_record(&self) -> bool {
        let (state, has_drive) = {
            let status = self.status.lock();
            (status.state, !status.drives.is_empty())
        };
        state == SessionState::Preview && has_drive && self.devices.lock().recording.is_empty()
    }

    fn ready_to_record(&self) -> bool {
        let has_drive = !self.status.lock().drives.is_empty();
        has_drive && self.devices.lock().recording.is_empty()
    }

    /// One fresh session folder per drive, created outside the status lock
    fn take_folders(&self) -> Result<Vec<std::path::PathBuf>> {
        let drives = self.drives();
        Ok(drives.take_folders()?)
    }

    fn busy() -> SessionError {
        SessionError::CannotRecord("a recording is already in progress".into())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Single shot (`frame_count` 1) or burst, back to preview when done.
    /// Returns the session summary.
    pub fn record_image_sequence(&self, frame_count: u64) -> Result<Value> {
        let path = if frame_count > 1 {
            [
                SessionState::BurstPrepare1,
                SessionState::BurstPrepare2,
                SessionState::BurstStart,
                SessionState::BurstFinalize,
            ]
        } else {
            [
                SessionState::SingleShotPrepare1,
                SessionState::SingleShotPrepare2,
                SessionState::SingleShotStart,
                SessionState::SingleShotFinalize,
            ]
        };

        let mut control = self.transition.try_lock().ok_or_else(Self::busy)?;
        control.frame_count = frame_count.max(1);
        for state in path {
            self.goto_state_locked(&control, state)?;
        }
        self.goto_state_locked(&control, SessionState::Preview)?;
        self.last_summary()
            .ok_or_else(|| SessionError::CannotRecord("no summary produced".into()))
    }

    /// Arm and trigger a continuous recording on every capturing camera
    pub fn start_recording_all(&self) -> Result<()> {
        let control = self.transition.try_lock().ok_or_else(Self::busy)?;
        for state in [
            SessionState::ContinuousPrepare1,
            SessionState::ContinuousPrepare2,
            SessionState::ContinuousStart,
        ] {
            self.goto_state_locked(&control, state)?;
        }
        Ok(())
    }

    /// End a continuous recording and return the session summary
    pub fn stop_recording_all(&self) -> Result<Value> {
        let control = self.transition.lock();
        if self.state() == SessionState::ContinuousStart {
            self.goto_state_locked(&control, SessionState::StopSync)?;
        }
        self.goto_state_locked(&control, SessionState::Stop)?;
        self.goto_state_locked(&control, SessionState::Preview)?;
        self.last_summary()
            .ok_or_else(|| SessionError::CannotRecord("no summary produced".into()))
    }

    pub fn goto_state(&self, next: SessionState) -> Result<()> {
        let control = self.transition.lock();
        self.goto_state_locked(&control, next)
    }

    fn goto_state_locked(&self, control: &Control, next: SessionState) -> Result<()> {
        let from = {
            let mut status = self.status.lock();
            let from = status.state;
            if !from.can_transition_to(next) {
                return Err(SessionError::InvalidTransition { from, to: next });
            }
            status.state = next;
            from
        };

        log::info!("[Node] State change from {} to {}", from, next);
        self.context.notify_state(next.as_str());

        let result = match next {
            SessionState::Preview => {
                self.start_preview_sync();
                Ok(())
            }
            SessionState::SingleShotPrepare1 | SessionState::BurstPrepare1 => self.prepare_single(control),
            SessionState::SingleShotPrepare2 | SessionState::BurstPrepare2 => {
                self.release_holds();
                Ok(())
            }
            SessionState::SingleShotStart | SessionState::BurstStart | SessionState::ContinuousStart => {
                self.recording_trigger();
                Ok(())
            }
            SessionState::SingleShotFinalize | SessionState::BurstFinalize => {
                self.finalize_single();
                Ok(())
            }
            SessionState::ContinuousPrepare1 => self.prepare_continuous(),
            SessionState::ContinuousPrepare2 => {
                self.release_holds();
                self.stop_sync();
                Ok(())
            }
            SessionState::StopSync => {
                self.stop_sync();
                Ok(())
            }
            SessionState::Stop => {
                self.stop_all();
                Ok(())
            }
        };

        if let Err(e) = &result {
            log::error!("[Node] {} failed: {}", next, e);
            self.abort();
        }
        result
    }

    /// Undo a failed preparation and go back to preview
    fn abort(&self) {
        let cameras = std::mem::take(&mut self.devices.lock().recording);
        let bitdepth = self.config.lock().bitdepth_default;
        for camera in &cameras {
            camera.stop_recording();
            camera.set_bitdepth(bitdepth);
        }
        let from = std::mem::replace(&mut self.status.lock().state, SessionState::Preview);
        log::info!("[Node] State change from {} to {}", from, SessionState::Preview);
        self.context.notify_state(SessionState::Preview.as_str());
        self.start_preview_sync();
    }

    fn prepare_single(&self, control: &Control) -> Result<()> {
        if !self.ready_to_record() {
            return Err(self.cannot_record_reason());
        }
        let config = self.config();
        let folders = self.take_folders()?;
        let frame_count = control.frame_count;

        // Audio-only devices have nothing to contribute to a still
        let cameras: Vec<Arc<Camera>> = {
            let mut devices = self.devices.lock();
            devices.recording = devices
                .cameras
                .iter()
                .filter(|c| c.capturing() && !c.is_audio_only())
                .cloned()
                .collect();
            devices.recording.clone()
        };
        if cameras.is_empty() {
            return Err(SessionError::NoCameras);
        }
        log::info!("[Node] Recording {} frame(s) on {} camera(s)", frame_count, cameras.len());

        let settle = Duration::from_millis(config.bitdepth_settle_ms);
        for camera in &cameras {
            if camera.set_bitdepth(config.bitdepth_single) {
                camera.block_until_next_frame(settle);
            }
        }

        let settings = RecordingSettings::from_config(&config);
        let single = allocate_single(cameras.len(), &folders);
        for (camera, single_folder) in cameras.iter().zip(single) {
            // A burst spreads its frames over every drive
            let camera_folders = if frame_count > 1 { folders.clone() } else { single_folder };
            camera.start_recording(camera_folders, true, Some(frame_count), &settings)?;
        }
        Ok(())
    }

    fn prepare_continuous(&self) -> Result<()> {
        if !self.ready_to_record() {
            return Err(self.cannot_record_reason());
        }
        let config = self.config();

        let cameras: Vec<Arc<Camera>> = self
            .camera_list()
            .into_iter()
            .filter(|c| c.capturing())
            .collect();
        if cameras.is_empty() {
            return Err(SessionError::NoCameras);
        }

        let sources: Vec<(String, f64)> = cameras
            .iter()
            .map(|c| (c.unique_id().to_string(), c.bandwidth()))
            .collect();
        let folders = self.take_folders()?;
        let allocations = allocate_stream(&sources, &folders, config.bandwidth_per_thread_mb_s);

        let ordered: Vec<Arc<Camera>> = allocations
            .iter()
            .filter_map(|a| cameras.iter().find(|c| c.unique_id() == a.unique_id).cloned())
            .collect();
        self.devices.lock().recording = ordered.clone();

        let settings = RecordingSettings::from_config(&config);
        for (camera, allocation) in ordered.iter().zip(allocations) {
            log::info!(
                "[Node] Record {} at {:.1} MB/s on {} thread(s)",
                allocation.unique_id,
                allocation.bandwidth_mb_s,
                allocation.threads
            );
            camera.start_recording(allocation.folders, true, None, &settings)?;
        }
        Ok(())
    }

    fn cannot_record_reason(&self) -> SessionError {
        if self.status.lock().drives.is_empty() {
            SessionError::CannotRecord("no usable recording drive".into())
        } else {
            Self::busy()
        }
    }

    fn release_holds(&self) {
        for camera in self.recording_cameras() {
            camera.remove_recording_hold();
        }
    }

    fn recording_trigger(&self) {
        for camera in self.recording_cameras() {
            if !camera.using_hardware_sync() {
                camera.software_trigger();
            }
        }

        // Synchronized cameras see the pause as their trigger
        if let Some(sync) = &self.context.sync {
            let settle = Duration::from_millis(self.config.lock().sync_settle_ms);
            sync.stop();
            std::thread::sleep(settle);
            self.start_recording_sync();
        }
    }

    /// Wait for every camera of a single shot or burst to finish, then merge
    /// the summaries
    fn finalize_single(&self) {
        let config = self.config();
        let cameras = self.recording_cameras();
        let deadline = Instant::now() + config.finalize_timeout();

        let mut summaries = Vec::with_capacity(cameras.len());
        for camera in &cameras {
            if let Err(e) = camera.start_capture() {
                log::warn!("[Node] {} could not resume capture: {}", camera.unique_id(), e);
            }

            let mut forced = false;
            while camera.recording() {
                if !camera.is_valid() || Instant::now() >= deadline {
                    log::warn!("[Node] {} did not finish in time, stopping it", camera.unique_id());
                    camera.stop_recording();
                    forced = true;
                    break;
                }
                std::thread::sleep(config.finalize_poll());
            }

            if let Some(summary) = camera_summary(camera, forced) {
                summaries.push(summary);
            }
            camera.set_bitdepth(config.bitdepth_default);
        }

        self.devices.lock().recording.clear();
        self.status.lock().last_summary = Some(json!({ "cameras": summaries }));
    }

    fn stop_all(&self) {
        let cameras = self.recording_cameras();
        let bitdepth = self.config.lock().bitdepth_default;

        for camera in &cameras {
            camera.stop_recording();
        }
        let summaries: Vec<Value> = cameras.iter().filter_map(|c| camera_summary(c, false)).collect();
        for camera in &cameras {
            camera.set_bitdepth(bitdepth);
        }

        self.devices.lock().recording.clear();
        self.status.lock().last_summary = Some(json!({ "cameras": summaries }));
    }

    // ========================================================================
    // Hardware sync
    // ========================================================================

    fn start_preview_sync(&self) {
        if let Some(sync) = &self.context.sync {
            let config = self.config();
            sync.start(config.global_framerate, config.pulse_duration_us, config.external_sync_preview);
            self.sync_active.store(true, Ordering::SeqCst);
        }
    }

    fn start_recording_sync(&self) {
        if let Some(sync) = &self.context.sync {
            let config = self.config();
            sync.start(config.global_framerate, config.pulse_duration_us, config.external_sync_recording);
            self.sync_active.store(true, Ordering::SeqCst);
        }
    }

    fn stop_sync(&self) {
        if let Some(sync) = &self.context.sync {
            if self.sync_active.swap(false, Ordering::SeqCst) {
                sync.stop();
            }
        }
    }

    /// Change the pulse frequency. A running pulse train restarts with it.
    pub fn set_global_framerate(&self, framerate: f64, pulse_duration_us: u32, external_sync: bool) {
        let (preview_external, duration) = {
            let mut config = self.config.lock();
            config.global_framerate = framerate;
            if pulse_duration_us > 0 {
                config.pulse_duration_us = pulse_duration_us;
            }
            config.external_sync_recording = external_sync;
            (config.external_sync_preview, config.pulse_duration_us)
        };
        log::info!("[Node] Global framerate {} Hz, pulse {} us", framerate, duration);

        if let (true, Some(sync)) = (self.sync_active.load(Ordering::SeqCst), &self.context.sync) {
            sync.start(framerate, duration, preview_external);
        }
    }

    // ========================================================================
    // Global parameters
    // ========================================================================

    /// Apply the parameter document sent by the control server
    pub fn apply_global_params(&self, params: &str) -> Result<()> {
        let doc: Value = serde_json::from_str(params)?;
        let doc = doc
            .as_object()
            .ok_or_else(|| SessionError::BadParams("expected a JSON object".into()))?;

        if let Some(bitdepth) = doc.get("bitdepth_avi").and_then(Value::as_u64) {
            let bitdepth = bitdepth as u8;
            let changed = {
                let mut config = self.config.lock();
                let changed = config.bitdepth_default != bitdepth;
                config.bitdepth_default = bitdepth;
                changed
            };
            if changed {
                for camera in self.camera_list().iter().filter(|c| !c.recording()) {
                    camera.set_bitdepth(bitdepth);
                }
            }
        }

        if let Some(bitdepth) = doc.get("bitdepth_single").and_then(Value::as_u64) {
            self.config.lock().bitdepth_single = bitdepth as u8;
        }

        if let Some(format) = doc.get("image_format").and_then(Value::as_str) {
            match StillFormat::parse(format) {
                Some(format) => self.config.lock().image_format = format,
                None => log::warn!("[Node] Unknown image format {:?}", format),
            }
        }

        if let (Some(r), Some(g), Some(b)) = (
            doc.get("wb_R").and_then(Value::as_f64),
            doc.get("wb_G").and_then(Value::as_f64),
            doc.get("wb_B").and_then(Value::as_f64),
        ) {
            let balance = ColorBalance { k_r: r as f32, k_g: g as f32, k_b: b as f32 };
            self.config.lock().color_balance = balance;
            for camera in self.camera_list() {
                camera.update_color_balance(balance);
            }
        }

        let pulse_duration = doc.get("pulse_duration").and_then(Value::as_u64).unwrap_or(0) as u32;
        let external_sync = doc.get("external_sync").and_then(Value::as_bool).unwrap_or(false);
        // Some servers send the frequency as a string
        let frequency = doc.get("frequency").and_then(|v| {
            v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        });
        let sync_freq = doc
            .get("sync_freq")
            .and_then(Value::as_f64)
            .filter(|_| doc.contains_key("pulse_duration"));

        for framerate in [frequency, sync_freq].into_iter().flatten() {
            self.set_global_framerate(framerate, pulse_duration, external_sync);
            for camera in self.camera_list() {
                camera.set_hardware_sync_freq(framerate);
            }
        }

        if let Some(cameras) = doc.get("camera_params").and_then(Value::as_array) {
            let framerate = self.config.lock().global_framerate;
            for entry in cameras.iter().filter_map(Value::as_object) {
                let Some(unique_id) = entry.get("unique_id").and_then(Value::as_str) else {
                    continue;
                };
                let Some(camera) = self.camera_by_id(unique_id) else {
                    log::warn!("[Node] Parameters for unknown camera {}", unique_id);
                    continue;
                };
                for (name, value) in entry {
                    match (name.as_str(), value) {
                        ("unique_id", _) => {}
                        ("using_sync", Value::Bool(enabled)) => camera.set_hardware_sync(*enabled, framerate),
                        (_, Value::Number(number)) => {
                            if let Some(value) = number.as_f64() {
                                if let Err(e) = camera.param_set(name, value) {
                                    log::warn!("[Node] {}: {}", unique_id, e);
                                }
                            }
                        }
                        _ => log::debug!("[Node] Ignoring parameter {} for {}", name, unique_id),
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop any recording, capture and the pulse train
    pub fn shutdown(&self) {
        {
            let control = self.transition.lock();
            if self.state().is_recording() {
                if let Err(e) = self.goto_state_locked(&control, SessionState::Stop) {
                    log::warn!("[Node] Stop on shutdown failed: {}", e);
                }
            }
            self.stop_sync();
        }
        for camera in self.camera_list() {
            camera.stop_capture();
        }
    }
}

impl Drop for CaptureNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Summary of one camera's last recording, with the finalize outcome
fn camera_summary(camera: &Camera, forced: bool) -> Option<Value> {
    let mut summary = camera.last_summary()?;
    if let Some(Value::Object(info)) = summary.get_mut("camera") {
        info.insert("error_finalize_timeout".into(), json!(forced));
    }
    Some(Value::Object(summary))
}
