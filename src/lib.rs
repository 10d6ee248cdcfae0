// Capture Node - synchronized multi-camera recording
// Main library entry point

pub mod config;
pub mod container;
pub mod imaging;
pub mod pipeline;
pub mod recording;
pub mod session;
pub mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::Config;
use container::BayerPattern;
use session::sync::LogListener;
use session::{CaptureNode, NodeContext};
use source::{SyntheticConfig, SyntheticDriver, SyntheticSync};

/// What the command line asked for
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Single,
    Burst(u64),
    Record(f64),
}

#[derive(Debug, Clone)]
pub struct Options {
    pub config_path: PathBuf,
    pub folders: Vec<PathBuf>,
    pub cameras: usize,
    pub width: u32,
    pub height: u32,
    pub bitcount: u8,
    pub framerate: f64,
    pub bayer: bool,
    pub sync: bool,
    pub save_config: bool,
    pub verbose: bool,
    pub action: Action,
}

impl Options {
    pub fn parse(args: &[String]) -> anyhow::Result<Self> {
        let value = |flag: &str| -> Option<&String> {
            args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1))
        };
        let number = |flag: &str| -> anyhow::Result<Option<f64>> {
            value(flag)
                .map(|v| v.parse::<f64>().map_err(|e| anyhow::anyhow!("{} {}: {}", flag, v, e)))
                .transpose()
        };

        let folders = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--folder")
            .filter_map(|(i, _)| args.get(i + 1).map(PathBuf::from))
            .collect();

        let (width, height) = match value("--size") {
            Some(size) => {
                let (w, h) = size
                    .split_once('x')
                    .ok_or_else(|| anyhow::anyhow!("--size expects WIDTHxHEIGHT, got {}", size))?;
                (w.parse()?, h.parse()?)
            }
            None => (640, 480),
        };

        let action = if let Some(count) = number("--burst")? {
            Action::Burst(count.max(1.0) as u64)
        } else if let Some(secs) = number("--record")? {
            Action::Record(secs.max(0.0))
        } else {
            Action::Single
        };

        Ok(Self {
            config_path: value("--config").map(PathBuf::from).unwrap_or_else(config::default_config_path),
            folders,
            cameras: number("--cameras")?.map(|n| n as usize).unwrap_or(2),
            width,
            height,
            bitcount: number("--bits")?.map(|n| n as u8).unwrap_or(8),
            framerate: number("--fps")?.unwrap_or(30.0),
            bayer: args.iter().any(|a| a == "--bayer"),
            sync: args.iter().any(|a| a == "--sync"),
            save_config: args.iter().any(|a| a == "--save-config"),
            verbose: args.iter().any(|a| a == "--verbose"),
            action,
        })
    }
}

/// Run one capture session with synthetic cameras and print its summary
pub fn run(options: Options) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(&options.config_path);
    if !options.folders.is_empty() {
        config.recording_folders = options.folders.clone();
    }
    config.global_framerate = options.framerate;
    if options.save_config {
        config.save(&options.config_path)?;
        log::info!("Saved config to {}", options.config_path.display());
    }

    let mut context = NodeContext::new().with_listener(Arc::new(LogListener));
    let sync = options.sync.then(SyntheticSync::new);
    if let Some(sync) = &sync {
        context = context.with_sync(sync.clone());
    }

    let node = CaptureNode::new(config, context);
    for i in 0..options.cameras {
        let driver = SyntheticDriver::new(SyntheticConfig {
            unique_id: Some(format!("synthetic{}", i)),
            width: options.width,
            height: options.height,
            bitcount: options.bitcount,
            framerate: options.framerate,
            bayer: options.bayer.then_some(BayerPattern::Rggb),
            sync: sync.clone(),
            ..SyntheticConfig::default()
        });
        let camera = node.add_driver(Box::new(driver))?;
        if options.sync {
            camera.set_hardware_sync(true, options.framerate);
        }
    }

    // Let every camera deliver a few frames before recording
    for camera in node.camera_list() {
        camera.block_until_next_frame(Duration::from_secs(1));
    }

    let summary = match options.action {
        Action::Single => node.record_image_sequence(1)?,
        Action::Burst(count) => node.record_image_sequence(count)?,
        Action::Record(secs) => {
            node.start_recording_all()?;
            std::thread::sleep(Duration::from_secs_f64(secs));
            node.stop_recording_all()?
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    node.shutdown();
    Ok(())
}
