//! Capture Node
//!
//! Records a single shot, a burst or a continuous take from synthetic cameras
//! and prints the session summary as JSON.
//!
//! Usage:
//!   capture-node [OPTIONS]
//!
//! Options:
//!   --single              One still per camera (default)
//!   --burst <n>           n stills per camera, spread over every drive
//!   --record <secs>       Continuous recording for secs seconds
//!   --folder <path>       Recording folder, repeat for several drives
//!   --config <path>       Config file (default: user config dir)
//!   --cameras <n>         Number of synthetic cameras (default: 2)
//!   --size <WxH>          Sensor size (default: 640x480)
//!   --bits <n>            Sensor bit depth (default: 8)
//!   --fps <f>             Framerate (default: 30)
//!   --bayer               RGGB color sensors
//!   --sync                Cameras follow a software pulse generator
//!   --save-config         Write the effective config back
//!   --verbose             Debug logging

use capture_node_lib::{run, Options};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose");
    let log_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let result = Options::parse(&args).and_then(run);
    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
