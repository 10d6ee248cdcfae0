//! Capture Node Pipeline Benchmark
//!
//! Pushes synthetic frames through a stream recorder writing the indexed
//! container, at the nominal framerate or as fast as possible, and reports
//! throughput, compression and dropped frames per configuration.
//!
//! Usage:
//!   cargo run --features tempfile --bin pipeline_benchmark [-- [OPTIONS]]
//!
//! Options:
//!   --frames <n>        Frames per run (default: 600)
//!   --size <WxH>        Frame size (default: 1920x1080)
//!   --bits <n>          Bit depth (default: 12)
//!   --fps <f>           Push rate, 0 = unthrottled (default: 0)
//!   --folder <path>     Write here instead of a temp dir
//!   --verbose           Extra debug output

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use capture_node_lib::config::StreamFormat;
use capture_node_lib::container::{ColorBalance, ContainerReader};
use capture_node_lib::recording::stream::StreamSettings;
use capture_node_lib::recording::{ImageView, Recorder, StreamInfo, StreamRecorder, SummaryDoc};

/// (shards, encode workers) per run
const RUNS: &[(usize, usize)] = &[(1, 1), (1, 2), (1, 4), (2, 2), (4, 2)];

struct RunResult {
    shards: usize,
    workers: usize,
    elapsed: Duration,
    frames: u64,
    dropped: u64,
    bytes: u64,
    missing_slots: usize,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose");
    let value = |flag: &str| args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1));
    let frames = value("--frames").and_then(|s| s.parse::<u64>().ok()).unwrap_or(600);
    let bits = value("--bits").and_then(|s| s.parse::<u8>().ok()).unwrap_or(12);
    let fps = value("--fps").and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
    let (width, height) = value("--size")
        .and_then(|s| s.split_once('x'))
        .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)))
        .unwrap_or((1920, 1080));
    let folder = value("--folder").map(PathBuf::from);

    let log_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    println!("\n=== Capture Node Pipeline Benchmark ===\n");
    println!("  Frame:      {}x{} @ {} bit", width, height, bits);
    println!("  Frames:     {} per run", frames);
    if fps > 0.0 {
        println!("  Push rate:  {:.1} fps", fps);
    } else {
        println!("  Push rate:  unthrottled");
    }
    println!();

    let temp_dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("  Failed to create temp dir: {}", e);
            std::process::exit(1);
        }
    };
    let root = folder.unwrap_or_else(|| temp_dir.path().to_path_buf());

    let pixels = generate_frame(width, height, bits);
    let mut results = Vec::new();
    for (i, &(shards, workers)) in RUNS.iter().enumerate() {
        let run_dir = root.join(format!("run{}", i));
        match run(&run_dir, &pixels, width, height, bits, fps, frames, shards, workers) {
            Ok(result) => {
                println!(
                    "  [{}/{}] {} shard(s), {} worker(s): {:.1} fps, {} dropped",
                    i + 1,
                    RUNS.len(),
                    shards,
                    workers,
                    result.frames as f64 / result.elapsed.as_secs_f64(),
                    result.dropped
                );
                results.push(result);
            }
            Err(e) => println!("  [{}/{}] FAILED: {}", i + 1, RUNS.len(), e),
        }
        if let Err(e) = std::fs::remove_dir_all(&run_dir) {
            log::debug!("Could not clean {}: {}", run_dir.display(), e);
        }
    }

    print_summary(&results, width as u64 * height as u64 * if bits > 8 { 2 } else { 1 });
}

/// Gradient with noise in the low bits, roughly as compressible as a sensor image
fn generate_frame(width: u32, height: u32, bits: u8) -> Vec<u8> {
    let max = (1u32 << bits) - 1;
    let mut seed = 0x2545_f491u32;
    let mut data = Vec::with_capacity((width * height * 2) as usize);
    for y in 0..height {
        for x in 0..width {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let base = (x * max / width.max(1) + y * max / height.max(1)) / 2;
            let value = (base + (seed & 7)).min(max);
            if bits > 8 {
                data.extend_from_slice(&(value as u16).to_le_bytes());
            } else {
                data.push(value as u8);
            }
        }
    }
    data
}

#[allow(clippy::too_many_arguments)]
fn run(
    dir: &Path,
    pixels: &[u8],
    width: u32,
    height: u32,
    bits: u8,
    fps: f64,
    frames: u64,
    shards: usize,
    workers: usize,
) -> anyhow::Result<RunResult> {
    let info = StreamInfo {
        unique_id: "bench".into(),
        framerate: if fps > 0.0 { fps } else { 30.0 },
        width,
        height,
        bitcount: bits,
        black_level: 0,
        bayer: None,
        balance: ColorBalance::default(),
    };
    let folders: Vec<PathBuf> = (0..shards).map(|i| dir.join(format!("drive{}", i))).collect();
    let settings = StreamSettings {
        format: StreamFormat::Container,
        queue_capacity: 300,
        writer_capacity: 32,
        workers,
    };
    let recorder = StreamRecorder::new(info.clone(), folders, settings)?;

    let interval = 1.0 / info.framerate;
    let view = ImageView::new(pixels, width, height, bits);
    let start = Instant::now();
    for i in 0..frames {
        let ts = i as f64 * interval;
        if fps > 0.0 {
            let due = Duration::from_secs_f64(ts);
            if let Some(wait) = due.checked_sub(start.elapsed()) {
                std::thread::sleep(wait);
            }
        }
        recorder.append(&view, ts, 0);
    }
    recorder.close();
    let elapsed = start.elapsed();

    let mut doc = SummaryDoc::new();
    recorder.summarize(&mut doc);
    let dropped = doc["recorder"]["dropped_frames"].as_u64().unwrap_or(0);
    let bytes = doc["recorder"]["total_size"].as_u64().unwrap_or(0);

    let mut missing_slots = 0;
    for file in recorder.filenames() {
        missing_slots += ContainerReader::open(file)?.missing_slots().len();
    }

    Ok(RunResult {
        shards,
        workers,
        elapsed,
        frames,
        dropped,
        bytes,
        missing_slots,
    })
}

fn print_summary(results: &[RunResult], frame_bytes: u64) {
    println!("\n  {:<8} {:<8} {:>10} {:>10} {:>8} {:>8} {:>8}", "Shards", "Workers", "fps", "MB/s in", "Ratio", "Dropped", "Gaps");
    println!("  {}", "-".repeat(66));
    for r in results {
        let secs = r.elapsed.as_secs_f64().max(1e-9);
        let written = r.frames - r.dropped;
        let ratio = if r.bytes > 0 { (written * frame_bytes) as f64 / r.bytes as f64 } else { 0.0 };
        println!(
            "  {:<8} {:<8} {:>10.1} {:>10.1} {:>8.2} {:>8} {:>8}",
            r.shards,
            r.workers,
            r.frames as f64 / secs,
            (r.frames * frame_bytes) as f64 / secs / 1_048_576.0,
            ratio,
            r.dropped,
            r.missing_slots
        );
    }
    println!();
}
