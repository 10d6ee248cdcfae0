// Capture sources - the boundary between device drivers and recorders
//
// A driver owns the acquisition thread and hands every frame to its
// `Camera`, which timestamps it, detects the recording trigger and fans the
// frame out to the active recorders.

pub mod camera;
pub mod synthetic;
pub mod trigger;

pub use camera::{Camera, RecordingSettings};
pub use synthetic::{SyntheticConfig, SyntheticDriver, SyntheticSync};
pub use trigger::TriggerDetector;

use std::sync::Weak;

use serde::Serialize;

use crate::container::BayerPattern;
use crate::recording::RecorderError;

/// Error type for source operations
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("{0} is already recording")]
    AlreadyRecording(String),

    #[error("{0} is no longer available")]
    Invalid(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Sensor output format as currently configured
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorFormat {
    pub width: u32,
    pub height: u32,
    pub bitcount: u8,
    pub framerate: f64,
    pub bayer: Option<BayerPattern>,
}

/// Range of a numeric driver parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

/// Optional capability: motorized lens
pub trait LensControl: Send + Sync {
    fn autofocus(&self) -> Result<()>;
    fn move_focus(&self, steps: i32) -> Result<()>;
    fn focus_position(&self) -> i32;
}

/// Optional capability: sensor region of interest
pub trait RoiControl: Send + Sync {
    fn set_roi(&self, x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Result<()>;
    fn reset_roi(&self) -> Result<()>;
}

/// Per-vendor device behavior
///
/// Only identity, format and capture control are mandatory. Everything else
/// has a default that reports the feature as absent.
pub trait CameraDriver: Send + Sync {
    fn unique_id(&self) -> String;

    fn model(&self) -> String;

    fn version(&self) -> String {
        String::new()
    }

    fn is_audio_only(&self) -> bool {
        false
    }

    fn format(&self) -> SensorFormat;

    /// Start the acquisition thread. Frames go to `sink.got_image`.
    fn start_capture(&self, sink: Weak<Camera>) -> Result<()>;

    fn stop_capture(&self);

    /// False once the device has disconnected
    fn is_valid(&self) -> bool {
        true
    }

    /// Returns whether the bit depth actually changed
    fn set_bitdepth(&self, _bitcount: u8) -> bool {
        false
    }

    fn set_hardware_sync(&self, _enabled: bool, _framerate: f64) {}

    fn params(&self) -> Vec<(String, ParamRange)> {
        Vec::new()
    }

    fn param_get(&self, _name: &str) -> Option<f64> {
        None
    }

    fn param_set(&self, name: &str, _value: f64) -> Result<()> {
        Err(SourceError::UnknownParameter(name.to_string()))
    }

    fn lens_control(&self) -> Option<&dyn LensControl> {
        None
    }

    fn roi_control(&self) -> Option<&dyn RoiControl> {
        None
    }
}
