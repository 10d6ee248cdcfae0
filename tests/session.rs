// End-to-end sessions with synthetic cameras

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capture_node_lib::config::{Config, StillFormat};
use capture_node_lib::container::ContainerReader;
use capture_node_lib::session::sync::CollectingListener;
use capture_node_lib::session::{CaptureNode, DrivePool, NodeContext, SessionState};
use capture_node_lib::source::{SyntheticConfig, SyntheticDriver, SyntheticSync};
use serde_json::Value;

fn test_config() -> Config {
    Config {
        image_format: StillFormat::Raw,
        image_workers: 2,
        finalize_timeout_secs: 5,
        ..Config::default()
    }
}

fn node(drives: &[PathBuf], context: NodeContext) -> CaptureNode {
    let pool = DrivePool::scan(drives, 0.0, 0);
    assert_eq!(pool.len(), drives.len());
    CaptureNode::with_drives(test_config(), context, pool)
}

fn camera(id: &str, sync: Option<Arc<SyntheticSync>>) -> Box<SyntheticDriver> {
    Box::new(SyntheticDriver::new(SyntheticConfig {
        unique_id: Some(id.into()),
        width: 16,
        height: 8,
        framerate: 50.0,
        sync,
        ..SyntheticConfig::default()
    }))
}

fn warm_up(node: &CaptureNode) {
    for camera in node.camera_list() {
        assert!(camera.block_until_next_frame(Duration::from_secs(2)));
    }
}

fn filenames(summary: &Value) -> Vec<PathBuf> {
    summary["recorder"]["filenames"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| PathBuf::from(f.as_str().unwrap()))
        .collect()
}

fn camera_entry<'a>(summary: &'a Value, id: &str) -> &'a Value {
    summary["cameras"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["unique_id"] == id)
        .unwrap()
}

fn under(path: &Path, drive: &Path) -> bool {
    path.starts_with(drive)
}

#[test]
fn single_shot_writes_one_still_per_camera() {
    let dir = tempfile::tempdir().unwrap();
    let drives = vec![dir.path().join("d0"), dir.path().join("d1")];
    let listener = Arc::new(CollectingListener::default());
    let node = node(&drives, NodeContext::new().with_listener(listener.clone()));
    node.add_driver(camera("left", None)).unwrap();
    node.add_driver(camera("right", None)).unwrap();
    warm_up(&node);

    let summary = node.record_image_sequence(1).unwrap();
    assert_eq!(node.state(), SessionState::Preview);
    assert!(node.recording_cameras().is_empty());
    assert_eq!(summary["cameras"].as_array().unwrap().len(), 2);

    for id in ["left", "right"] {
        let entry = camera_entry(&summary, id);
        let files = filenames(entry);
        assert_eq!(files.len(), 1);
        assert!(files[0].exists());
        assert_eq!(entry["camera"]["error_finalize_timeout"], false);
        assert_eq!(entry["camera"]["error_trigger_timeout"], false);
        assert_eq!(entry["meta"]["frame_count"], 1);
        assert!(entry["jpeg_thumbnail"].is_string());
    }

    // Two cameras, two drives: one camera per drive
    let left = filenames(camera_entry(&summary, "left"))[0].clone();
    let right = filenames(camera_entry(&summary, "right"))[0].clone();
    assert_ne!(under(&left, &drives[0]), under(&right, &drives[0]));

    assert_eq!(
        *listener.states.lock(),
        vec![
            "STATE_SINGLESHOT_PREPARE1",
            "STATE_SINGLESHOT_PREPARE2",
            "STATE_SINGLESHOT_START",
            "STATE_SINGLESHOT_FINALIZE",
            "STATE_PREVIEW",
        ]
    );
}

#[test]
fn burst_spreads_frames_over_every_drive() {
    let dir = tempfile::tempdir().unwrap();
    let drives = vec![dir.path().join("d0"), dir.path().join("d1")];
    let node = node(&drives, NodeContext::new());
    node.add_driver(camera("cam", None)).unwrap();
    warm_up(&node);

    let summary = node.record_image_sequence(6).unwrap();
    let entry = camera_entry(&summary, "cam");
    let files = filenames(entry);
    assert_eq!(files.len(), 6);
    assert!(files.iter().all(|f| f.exists()));
    assert_eq!(files.iter().filter(|f| under(f, &drives[0])).count(), 3);
    assert_eq!(files.iter().filter(|f| under(f, &drives[1])).count(), 3);
    assert_eq!(entry["meta"]["frame_count"], 6);

    // The camera is back in preview and can record again
    assert!(node.can_record());
    let again = node.record_image_sequence(2).unwrap();
    assert_eq!(filenames(camera_entry(&again, "cam")).len(), 2);
}

#[test]
fn continuous_recording_produces_readable_containers() {
    let dir = tempfile::tempdir().unwrap();
    let drives = vec![dir.path().join("d0")];
    let listener = Arc::new(CollectingListener::default());
    let node = node(&drives, NodeContext::new().with_listener(listener.clone()));
    node.add_driver(camera("a", None)).unwrap();
    node.add_driver(camera("b", None)).unwrap();
    warm_up(&node);

    node.start_recording_all().unwrap();
    assert_eq!(node.state(), SessionState::ContinuousStart);
    assert!(!node.can_record());
    std::thread::sleep(Duration::from_millis(400));
    let summary = node.stop_recording_all().unwrap();

    for id in ["a", "b"] {
        let entry = camera_entry(&summary, id);
        let files = filenames(entry);
        assert_eq!(files.len(), 1);
        let reader = ContainerReader::open(&files[0]).unwrap();
        let frames = entry["meta"]["frame_count"].as_u64().unwrap();
        let dropped = entry["recorder"]["dropped_frames"].as_u64().unwrap();
        assert!(frames > 5, "only {} frames recorded", frames);
        assert_eq!(reader.recorded_frames() as u64, frames - dropped);
        assert_eq!(reader.header().width, 16);
        assert!(Path::new(entry["meta"]["meta_filename"].as_str().unwrap()).exists());
    }

    let states = listener.states.lock().clone();
    assert_eq!(
        &states[states.len() - 3..],
        &["STATE_STOP_SYNC", "STATE_STOP", "STATE_PREVIEW"]
    );
    assert!(node.can_record());
}

#[test]
fn synchronized_cameras_start_on_the_pulse_pause() {
    let dir = tempfile::tempdir().unwrap();
    let drives = vec![dir.path().join("d0")];
    let sync = SyntheticSync::new();
    let node = node(&drives, NodeContext::new().with_sync(sync.clone()));
    assert_eq!(node.sync_port().as_deref(), Some("synthetic"));

    let camera = node.add_driver(camera("synced", Some(sync.clone()))).unwrap();
    camera.set_hardware_sync(true, 50.0);
    warm_up(&node);

    let summary = node.record_image_sequence(1).unwrap();
    let entry = camera_entry(&summary, "synced");
    assert_eq!(entry["camera"]["using_hardware_sync"], true);
    assert_eq!(entry["camera"]["error_trigger_timeout"], false);
    assert_eq!(filenames(entry).len(), 1);

    // Preview pulses, the restart after the trigger pause, then preview again
    assert!(sync.starts().len() >= 3);
    assert_eq!(node.state(), SessionState::Preview);
}

#[test]
fn a_second_recording_cannot_start_while_one_runs() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&[dir.path().join("d0")], NodeContext::new());
    node.add_driver(camera("only", None)).unwrap();
    warm_up(&node);

    node.start_recording_all().unwrap();
    assert!(node.record_image_sequence(1).is_err());
    assert_eq!(node.state(), SessionState::ContinuousStart);
    node.stop_recording_all().unwrap();
    assert_eq!(node.state(), SessionState::Preview);
}

#[test]
fn queries_answer_while_a_session_runs() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(node(&[dir.path().join("d0")], NodeContext::new()));
    node.add_driver(camera("busy", None)).unwrap();
    warm_up(&node);

    // 40 frames at 50 fps keep the burst going for most of a second
    let session = {
        let node = node.clone();
        std::thread::spawn(move || node.record_image_sequence(40))
    };
    std::thread::sleep(Duration::from_millis(200));

    let asked = Instant::now();
    assert!(!node.can_record());
    assert_ne!(node.state(), SessionState::Preview);
    assert!(node.record_image_sequence(1).is_err());
    assert!(!node.drives().is_empty());
    assert!(asked.elapsed() < Duration::from_millis(150), "queries took {:?}", asked.elapsed());

    let summary = session.join().unwrap().unwrap();
    assert_eq!(filenames(camera_entry(&summary, "busy")).len(), 40);
    assert!(node.can_record());
    assert_eq!(node.state(), SessionState::Preview);
}
