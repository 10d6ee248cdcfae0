// Synthetic capture device
//
// Generates a moving gradient at a fixed framerate on its own thread. A driver
// can follow a `SyntheticSync`, in which case it only produces frames while the
// sync's pulse train is running, the way a hardware-triggered camera does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Camera, CameraDriver, LensControl, ParamRange, Result, RoiControl, SensorFormat, SourceError};
use crate::container::BayerPattern;
use crate::session::sync::HardwareSync;

/// Software pulse generator standing in for a sync box
#[derive(Debug)]
pub struct SyntheticSync {
    running: AtomicBool,
    framerate: Mutex<f64>,
    starts: Mutex<Vec<(f64, u32, bool)>>,
}

impl SyntheticSync {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            framerate: Mutex::new(30.0),
            starts: Mutex::new(Vec::new()),
        })
    }

    pub fn framerate(&self) -> f64 {
        *self.framerate.lock()
    }

    /// Every `start` call so far as (framerate, pulse duration, external)
    pub fn starts(&self) -> Vec<(f64, u32, bool)> {
        self.starts.lock().clone()
    }
}

impl HardwareSync for SyntheticSync {
    fn port(&self) -> String {
        "synthetic".into()
    }

    fn start(&self, framerate: f64, pulse_duration_us: u32, external: bool) {
        *self.framerate.lock() = framerate;
        self.starts.lock().push((framerate, pulse_duration_us, external));
        self.running.store(true, Ordering::SeqCst);
        log::debug!("[Sync] Pulses at {} Hz, {} us", framerate, pulse_duration_us);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        log::debug!("[Sync] Pulses stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Random serial when not set
    pub unique_id: Option<String>,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub bitcount: u8,
    pub framerate: f64,
    pub bayer: Option<BayerPattern>,
    pub black_level: u32,
    pub audio_only: bool,
    pub lens: bool,
    pub roi: bool,
    /// Pulse source followed while hardware sync is enabled
    pub sync: Option<Arc<SyntheticSync>>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            unique_id: None,
            model: "Synthetic".into(),
            width: 320,
            height: 240,
            bitcount: 8,
            framerate: 30.0,
            bayer: None,
            black_level: 0,
            audio_only: false,
            lens: false,
            roi: false,
            sync: None,
        }
    }
}

struct Shared {
    running: AtomicBool,
    valid: AtomicBool,
    bitcount: AtomicU8,
    sync_enabled: AtomicBool,
    framerate: Mutex<f64>,
    roi: Mutex<Option<[u32; 4]>>,
}

pub struct SyntheticDriver {
    unique_id: String,
    config: SyntheticConfig,
    shared: Arc<Shared>,
    params: Mutex<BTreeMap<String, f64>>,
    focus: AtomicI32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig) -> Self {
        let unique_id = config.unique_id.clone().unwrap_or_else(|| {
            let serial = uuid::Uuid::new_v4().simple().to_string();
            format!("SYN-{}", &serial[..8])
        });
        let params = param_table()
            .into_iter()
            .map(|(name, range)| (name.to_string(), range.default))
            .collect();

        Self {
            unique_id,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                valid: AtomicBool::new(true),
                bitcount: AtomicU8::new(config.bitcount),
                sync_enabled: AtomicBool::new(false),
                framerate: Mutex::new(config.framerate),
                roi: Mutex::new(None),
            }),
            config,
            params: Mutex::new(params),
            focus: AtomicI32::new(0),
            thread: Mutex::new(None),
        }
    }

    pub fn unplug_handle(&self) -> UnplugHandle {
        UnplugHandle(self.shared.clone())
    }

    fn frame_size(&self) -> (u32, u32) {
        self.shared.frame_size(self.config.width, self.config.height)
    }
}

impl Shared {
    /// Current ROI size, or the full sensor
    fn frame_size(&self, width: u32, height: u32) -> (u32, u32) {
        match *self.roi.lock() {
            Some([x0, y0, x1, y1]) => (x1 - x0, y1 - y0),
            None => (width, height),
        }
    }
}

/// Simulates unplugging the device, usable after it moved into a `Camera`
#[derive(Clone)]
pub struct UnplugHandle(Arc<Shared>);

impl UnplugHandle {
    pub fn unplug(&self) {
        self.0.valid.store(false, Ordering::SeqCst);
    }
}

fn param_table() -> Vec<(&'static str, ParamRange)> {
    vec![
        ("exposure", ParamRange { min: 10.0, max: 100_000.0, default: 5000.0 }),
        ("gain", ParamRange { min: 0.0, max: 24.0, default: 0.0 }),
    ]
}

/// Gradient that shifts by one step per frame
fn render(width: u32, height: u32, bitcount: u8, frame: u64) -> Vec<u8> {
    let levels = 1u64 << bitcount;
    let step = (levels / 256).max(1);
    let mut pixels = Vec::with_capacity((width * height) as usize * if bitcount > 8 { 2 } else { 1 });
    for y in 0..height {
        for x in 0..width {
            let value = ((x + y) as u64 + frame).wrapping_mul(step) % levels;
            if bitcount > 8 {
                pixels.extend_from_slice(&(value as u16).to_le_bytes());
            } else {
                pixels.push(value as u8);
            }
        }
    }
    pixels
}

impl CameraDriver for SyntheticDriver {
    fn unique_id(&self) -> String {
        self.unique_id.clone()
    }

    fn model(&self) -> String {
        self.config.model.clone()
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn is_audio_only(&self) -> bool {
        self.config.audio_only
    }

    fn format(&self) -> SensorFormat {
        let (width, height) = self.frame_size();
        SensorFormat {
            width,
            height,
            bitcount: self.shared.bitcount.load(Ordering::SeqCst),
            framerate: *self.shared.framerate.lock(),
            bayer: self.config.bayer,
        }
    }

    fn start_capture(&self, sink: Weak<Camera>) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let sync = self.config.sync.clone();
        let black_level = self.config.black_level;
        let (sensor_width, sensor_height) = (self.config.width, self.config.height);
        let origin = Instant::now();

        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.unique_id))
            .spawn(move || {
                let mut frame = 0u64;
                let mut next = Instant::now();
                while shared.running.load(Ordering::SeqCst) && shared.valid.load(Ordering::SeqCst) {
                    let following = shared.sync_enabled.load(Ordering::SeqCst);
                    let framerate = match (&sync, following) {
                        (Some(sync), true) => {
                            if !sync.is_running() {
                                std::thread::sleep(Duration::from_millis(1));
                                next = Instant::now();
                                continue;
                            }
                            sync.framerate()
                        }
                        _ => *shared.framerate.lock(),
                    };

                    next += Duration::from_secs_f64(1.0 / framerate.max(0.1));
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else {
                        next = now;
                    }

                    let Some(camera) = sink.upgrade() else { break };
                    let bitcount = shared.bitcount.load(Ordering::SeqCst);
                    let (width, height) = shared.frame_size(sensor_width, sensor_height);
                    let pixels = render(width, height, bitcount, frame);
                    // Device clock: seconds since capture start, never zero
                    let timestamp = 1.0 + origin.elapsed().as_secs_f64();
                    camera.got_image(&pixels, timestamp, width, height, bitcount, 1, black_level);
                    frame += 1;
                }
                log::debug!("[Synthetic] Capture thread exiting after {} frames", frame);
            })
            .map_err(|e| SourceError::Driver(format!("Failed to spawn capture thread: {}", e)))?;

        *thread = Some(handle);
        Ok(())
    }

    fn stop_capture(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            // The capture thread may hold the last reference to the camera
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn is_valid(&self) -> bool {
        self.shared.valid.load(Ordering::SeqCst)
    }

    fn set_bitdepth(&self, bitcount: u8) -> bool {
        if !(8..=16).contains(&bitcount) {
            return false;
        }
        self.shared.bitcount.swap(bitcount, Ordering::SeqCst) != bitcount
    }

    fn set_hardware_sync(&self, enabled: bool, framerate: f64) {
        self.shared.sync_enabled.store(enabled, Ordering::SeqCst);
        if enabled && framerate > 0.0 {
            *self.shared.framerate.lock() = framerate;
        }
    }

    fn params(&self) -> Vec<(String, ParamRange)> {
        param_table().into_iter().map(|(name, range)| (name.to_string(), range)).collect()
    }

    fn param_get(&self, name: &str) -> Option<f64> {
        self.params.lock().get(name).copied()
    }

    fn param_set(&self, name: &str, value: f64) -> Result<()> {
        let range = param_table()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, range)| range)
            .ok_or_else(|| SourceError::UnknownParameter(name.to_string()))?;
        self.params.lock().insert(name.to_string(), value.clamp(range.min, range.max));
        Ok(())
    }

    fn lens_control(&self) -> Option<&dyn LensControl> {
        if self.config.lens { Some(self as &dyn LensControl) } else { None }
    }

    fn roi_control(&self) -> Option<&dyn RoiControl> {
        if self.config.roi { Some(self as &dyn RoiControl) } else { None }
    }
}

impl LensControl for SyntheticDriver {
    fn autofocus(&self) -> Result<()> {
        self.focus.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn move_focus(&self, steps: i32) -> Result<()> {
        self.focus.fetch_add(steps, Ordering::SeqCst);
        Ok(())
    }

    fn focus_position(&self) -> i32 {
        self.focus.load(Ordering::SeqCst)
    }
}

impl RoiControl for SyntheticDriver {
    fn set_roi(&self, x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Result<()> {
        if x_min >= x_max || y_min >= y_max || x_max > self.config.width || y_max > self.config.height {
            return Err(SourceError::Driver(format!(
                "Invalid ROI {},{} - {},{}",
                x_min, y_min, x_max, y_max
            )));
        }
        *self.shared.roi.lock() = Some([x_min, y_min, x_max, y_max]);
        Ok(())
    }

    fn reset_roi(&self) -> Result<()> {
        *self.shared.roi.lock() = None;
        Ok(())
    }
}

impl Drop for SyntheticDriver {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn render_matches_bit_depth() {
        assert_eq!(render(4, 2, 8, 0).len(), 8);
        let wide = render(4, 2, 12, 3);
        assert_eq!(wide.len(), 16);
        let first = u16::from_le_bytes([wide[0], wide[1]]);
        assert!(first < 4096);
    }

    #[test]
    fn bitdepth_change_is_reported() {
        let driver = SyntheticDriver::new(SyntheticConfig::default());
        assert!(!driver.set_bitdepth(8));
        assert!(driver.set_bitdepth(12));
        assert_eq!(driver.format().bitcount, 12);
        assert!(!driver.set_bitdepth(24));
    }

    #[test]
    fn params_are_clamped_and_validated() {
        let driver = SyntheticDriver::new(SyntheticConfig::default());
        driver.param_set("gain", 100.0).unwrap();
        assert_eq!(driver.param_get("gain"), Some(24.0));
        assert!(matches!(driver.param_set("iris", 1.0), Err(SourceError::UnknownParameter(_))));
    }

    #[test]
    fn roi_changes_the_frame_size() {
        let driver = SyntheticDriver::new(SyntheticConfig { roi: true, ..SyntheticConfig::default() });
        let roi = driver.roi_control().unwrap();
        roi.set_roi(10, 20, 110, 70).unwrap();
        assert_eq!((driver.format().width, driver.format().height), (100, 50));
        assert!(roi.set_roi(0, 0, 1000, 10).is_err());
        roi.reset_roi().unwrap();
        assert_eq!(driver.format().width, 320);
    }

    #[test]
    fn roi_change_reaches_a_running_capture() {
        let driver = SyntheticDriver::new(SyntheticConfig {
            width: 16,
            height: 8,
            framerate: 100.0,
            roi: true,
            ..SyntheticConfig::default()
        });
        let camera = Camera::new(Box::new(driver), &Config::default());
        camera.start_capture().unwrap();
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));

        camera.roi().unwrap().set_roi(0, 0, 8, 4).unwrap();
        // One frame rendered before the change may still arrive full size
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));

        let preview = image::load_from_memory(&camera.preview_jpeg().unwrap()).unwrap();
        assert_eq!((preview.width(), preview.height()), (8, 4));
        assert_eq!((camera.format().width, camera.format().height), (8, 4));
        camera.stop_capture();
    }

    #[test]
    fn capture_thread_delivers_frames() {
        let driver = SyntheticDriver::new(SyntheticConfig {
            width: 8,
            height: 8,
            framerate: 200.0,
            ..SyntheticConfig::default()
        });
        let camera = Camera::new(Box::new(driver), &Config::default());
        camera.start_capture().unwrap();
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));
        camera.stop_capture();
        let count = camera.image_counter();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(camera.image_counter(), count);
    }

    #[test]
    fn synced_driver_pauses_with_the_pulse_train() {
        let sync = SyntheticSync::new();
        let driver = SyntheticDriver::new(SyntheticConfig {
            width: 8,
            height: 8,
            sync: Some(sync.clone()),
            ..SyntheticConfig::default()
        });
        let camera = Camera::new(Box::new(driver), &Config::default());
        camera.set_hardware_sync(true, 100.0);
        camera.start_capture().unwrap();

        assert!(!camera.block_until_next_frame(Duration::from_millis(100)));
        sync.start(100.0, 2000, false);
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));
        camera.stop_capture();
    }

    #[test]
    fn unplugged_device_stops_and_turns_invalid() {
        let driver = SyntheticDriver::new(SyntheticConfig {
            width: 8,
            height: 8,
            framerate: 200.0,
            ..SyntheticConfig::default()
        });
        let unplug = driver.unplug_handle();
        let camera = Camera::new(Box::new(driver), &Config::default());
        camera.start_capture().unwrap();
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));

        unplug.unplug();
        assert!(!camera.is_valid());
        assert!(!camera.capturing());
        camera.stop_capture();
    }
}
