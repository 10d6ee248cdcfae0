// Configuration management for the capture node

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::ColorBalance;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// One folder per drive; each session gets a timestamped sub-folder in each
    pub recording_folders: Vec<PathBuf>,

    /// Drives measured slower than this are not used for recording
    pub min_drive_speed_mb_s: f64,

    /// Size of the benchmark file written to each drive (0 = trust every drive)
    pub drive_benchmark_mb: u32,

    /// Disk throughput one writer thread is expected to sustain
    pub bandwidth_per_thread_mb_s: f64,

    /// Pulse frequency of the hardware sync device
    pub global_framerate: f64,

    /// Trigger pulse width in microseconds
    pub pulse_duration_us: u32,

    /// Whether the sync device follows an external trigger during preview
    pub external_sync_preview: bool,

    /// Whether the sync device follows an external trigger while recording
    pub external_sync_recording: bool,

    /// Bit depth used outside of single-shot captures
    pub bitdepth_default: u8,

    /// Bit depth used for single-shot and burst captures
    pub bitdepth_single: u8,

    /// Output format of still captures
    pub image_format: StillFormat,

    /// Output format of continuous recordings
    pub stream_format: StreamFormat,

    /// White balance applied to bayer sources
    pub color_balance: ColorBalance,

    /// Gap (in nominal frame intervals) above which the metadata log counts a
    /// missing frame
    pub missing_frame_threshold: f64,

    pub image_queue_capacity: usize,
    pub stream_queue_capacity: usize,
    pub writer_queue_capacity: usize,

    /// Still development threads per source (0 = one per core)
    pub image_workers: usize,

    /// Compression threads per stream shard
    pub encode_workers: usize,

    /// Frame gap that marks the start of a synchronized recording
    pub trigger_gap_secs: f64,

    /// Give up waiting for the trigger gap after this long
    pub trigger_timeout_secs: f64,

    /// Pause of the pulse train around the trigger
    pub sync_settle_ms: u64,

    /// Wait for a frame at the new bit depth before a single shot
    pub bitdepth_settle_ms: u64,

    pub finalize_poll_ms: u64,
    pub finalize_timeout_secs: u64,
}

/// Still capture file format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StillFormat {
    /// Developed TIFF
    Tif,
    /// Undeveloped mosaic TIFF with a sensor info footer
    Raw,
}

impl Default for StillFormat {
    fn default() -> Self {
        Self::Tif
    }
}

impl StillFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StillFormat::Tif => "tif",
            StillFormat::Raw => "raw",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tif" | "tiff" => Some(StillFormat::Tif),
            "raw" => Some(StillFormat::Raw),
            _ => None,
        }
    }
}

/// Continuous recording file format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// LZ4 frames in the indexed container
    Container,
    /// Generic encoded video (needs the `video` feature)
    Video,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::Container
    }
}

impl StreamFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StreamFormat::Container => "ava",
            StreamFormat::Video => "mkv",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording_folders: vec![get_default_recording_folder()],
            min_drive_speed_mb_s: 40.0,
            drive_benchmark_mb: 64,
            bandwidth_per_thread_mb_s: 200.0,
            global_framerate: 30.0,
            pulse_duration_us: 2000,
            external_sync_preview: false,
            external_sync_recording: false,
            bitdepth_default: 8,
            bitdepth_single: 8,
            image_format: StillFormat::default(),
            stream_format: StreamFormat::default(),
            color_balance: ColorBalance::default(),
            missing_frame_threshold: 1.5,
            image_queue_capacity: 30,
            stream_queue_capacity: 300,
            writer_queue_capacity: 32,
            image_workers: 0,
            encode_workers: 2,
            trigger_gap_secs: 0.2,
            trigger_timeout_secs: 3.0,
            sync_settle_ms: 250,
            bitdepth_settle_ms: 240,
            finalize_poll_ms: 50,
            finalize_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file {}: {}", path.display(), e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Worker count for still development
    pub fn image_worker_count(&self) -> usize {
        if self.image_workers > 0 {
            self.image_workers
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        }
    }

    pub fn finalize_poll(&self) -> Duration {
        Duration::from_millis(self.finalize_poll_ms.max(1))
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }
}

/// Get the config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("capture-node")
        .join("config.toml")
}

/// Get the default recording folder
fn get_default_recording_folder() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("capture-node")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            bandwidth_per_thread_mb_s = 150.0
            image_format = "raw"

            [color_balance]
            k_r = 1.8
            k_g = 1.0
            k_b = 1.4
            "#,
        )
        .unwrap();

        assert_eq!(config.bandwidth_per_thread_mb_s, 150.0);
        assert_eq!(config.image_format, StillFormat::Raw);
        assert_eq!(config.color_balance.k_r, 1.8);
        assert_eq!(config.min_drive_speed_mb_s, 40.0);
        assert_eq!(config.missing_frame_threshold, 1.5);
        assert_eq!(config.stream_format, StreamFormat::Container);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.recording_folders = vec![dir.path().join("a"), dir.path().join("b")];
        config.finalize_timeout_secs = 3;
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(&path);
        assert_eq!(loaded.recording_folders, config.recording_folders);
        assert_eq!(loaded.finalize_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        let config = Config::load_or_default(&path);
        assert_eq!(config.global_framerate, 30.0);
    }

    #[test]
    fn still_format_names() {
        assert_eq!(StillFormat::parse("TIFF"), Some(StillFormat::Tif));
        assert_eq!(StillFormat::parse("raw"), Some(StillFormat::Raw));
        assert_eq!(StillFormat::parse("png"), None);
    }
}
