// Output folder allocation for a recording session

use std::path::PathBuf;

const MB: f64 = 1024.0 * 1024.0;

/// Writer threads (and so output folders) one source gets
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub unique_id: String,
    pub bandwidth_mb_s: f64,
    pub threads: usize,
    pub folders: Vec<PathBuf>,
}

/// Threads needed to write `bandwidth` bytes/s at `per_thread_mb_s` each
pub fn thread_count(bandwidth: f64, per_thread_mb_s: f64) -> usize {
    if per_thread_mb_s <= 0.0 {
        return 1;
    }
    1 + (bandwidth / MB / per_thread_mb_s) as usize
}

/// Continuous recording: sources sorted by descending thread need, folders
/// dealt round-robin over the flattened (source, thread) list so the busiest
/// source spreads over the most drives.
pub fn allocate_stream(sources: &[(String, f64)], folders: &[PathBuf], per_thread_mb_s: f64) -> Vec<Allocation> {
    let mut allocations: Vec<Allocation> = sources
        .iter()
        .map(|(unique_id, bandwidth)| Allocation {
            unique_id: unique_id.clone(),
            bandwidth_mb_s: bandwidth / MB,
            threads: thread_count(*bandwidth, per_thread_mb_s),
            folders: Vec::new(),
        })
        .collect();

    // Stable: equal needs keep their registration order
    allocations.sort_by(|a, b| b.threads.cmp(&a.threads));

    if folders.is_empty() {
        return allocations;
    }
    let mut next = 0;
    for allocation in &mut allocations {
        for _ in 0..allocation.threads {
            allocation.folders.push(folders[next % folders.len()].clone());
            next += 1;
        }
        log::debug!(
            "[Alloc] {} {:.1} MB/s -> {} thread(s) {:?}",
            allocation.unique_id,
            allocation.bandwidth_mb_s,
            allocation.threads,
            allocation.folders
        );
    }
    allocations
}

/// Single shot: one folder per source, a different drive for each source
pub fn allocate_single(source_count: usize, folders: &[PathBuf]) -> Vec<Vec<PathBuf>> {
    if folders.is_empty() {
        return vec![Vec::new(); source_count];
    }
    (0..source_count).map(|i| vec![folders[i % folders.len()].clone()]).collect()
}
