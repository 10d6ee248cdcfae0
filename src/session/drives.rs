// Drive pool - recording folders that passed the write benchmark
//
// Every session gets one timestamped sub-folder per drive.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;

const CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub folder: PathBuf,
    /// Measured write speed, `None` when benchmarking is disabled
    pub speed_mb_s: Option<f64>,
    pub free_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrivePool {
    drives: Vec<Drive>,
}

impl DrivePool {
    /// Benchmark each folder and keep the ones fast enough, fastest first.
    /// A `benchmark_mb` of 0 accepts every folder that can be created.
    pub fn scan(folders: &[PathBuf], min_speed_mb_s: f64, benchmark_mb: u32) -> Self {
        let mut drives = Vec::new();
        for folder in folders {
            if let Err(e) = std::fs::create_dir_all(folder) {
                log::warn!("[Drives] Skipping {}: {}", folder.display(), e);
                continue;
            }

            let speed_mb_s = if benchmark_mb > 0 {
                match benchmark_write(folder, benchmark_mb) {
                    Ok(speed) => Some(speed),
                    Err(e) => {
                        log::warn!("[Drives] Benchmark failed on {}: {}", folder.display(), e);
                        continue;
                    }
                }
            } else {
                None
            };

            if let Some(speed) = speed_mb_s {
                if speed < min_speed_mb_s {
                    log::warn!(
                        "[Drives] {} too slow ({:.0} MB/s < {:.0} MB/s)",
                        folder.display(),
                        speed,
                        min_speed_mb_s
                    );
                    continue;
                }
            }

            let drive = Drive {
                folder: folder.clone(),
                speed_mb_s,
                free_bytes: free_space(folder),
            };
            log::info!(
                "[Drives] {} ready ({} MB/s, {} GB free)",
                drive.folder.display(),
                drive.speed_mb_s.map(|s| format!("{:.0}", s)).unwrap_or_else(|| "?".into()),
                drive.free_bytes.map(|b| format!("{:.1}", b as f64 / 1e9)).unwrap_or_else(|| "?".into())
            );
            drives.push(drive);
        }

        drives.sort_by(|a, b| {
            b.speed_mb_s
                .unwrap_or(0.0)
                .partial_cmp(&a.speed_mb_s.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { drives }
    }

    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    /// Create this session's sub-folder on every drive
    pub fn take_folders(&self) -> std::io::Result<Vec<PathBuf>> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        // Two sessions within the same second get distinct folders
        let mut name = stamp.clone();
        let mut attempt = 1;
        while self.drives.iter().any(|d| d.folder.join(&name).exists()) {
            attempt += 1;
            name = format!("{}_{}", stamp, attempt);
        }

        let mut folders = Vec::with_capacity(self.drives.len());
        for drive in &self.drives {
            let folder = drive.folder.join(&name);
            std::fs::create_dir_all(&folder)?;
            folders.push(folder);
        }
        Ok(folders)
    }
}

/// Sequential write throughput of `folder` in MB/s
pub fn benchmark_write(folder: &Path, size_mb: u32) -> std::io::Result<f64> {
    let path = folder.join(format!(".benchmark-{}.tmp", uuid::Uuid::new_v4()));
    let chunk = vec![0xA5u8; CHUNK];

    let start = Instant::now();
    let result = (|| {
        let mut file = File::create(&path)?;
        for _ in 0..size_mb {
            file.write_all(&chunk)?;
        }
        file.sync_all()
    })();
    let elapsed = start.elapsed().as_secs_f64();
    let _ = std::fs::remove_file(&path);
    result?;

    Ok(size_mb as f64 / elapsed.max(1e-6))
}

/// Free space of the disk holding `folder`
pub fn free_space(folder: &Path) -> Option<u64> {
    let folder = folder.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| folder.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}
