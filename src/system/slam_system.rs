//! SlamSystem - top-level coordinator.
//!
//! Owns the shared map, the tracking front-end, and the background stages,
//! and enforces the per-frame coordination contract:
//!
//! 1. pending mode changes are fully applied (including waiting for the
//!    mapping stage to park) before the frame reaches tracking, so tracking
//!    never observes a half-applied mode;
//! 2. a pending reset is applied next;
//! 3. the frame is forwarded and the resulting state published under the
//!    state lock for concurrent readers.
//!
//! The mode, reset and state locks are narrow: each is held only to check
//! and clear flags or swap the published snapshot, never across the
//! stop-wait poll loop.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::bounded;
use image::GrayImage;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::features::KeyPoint;
use crate::geometry::SE3;
use crate::io::trajectory;
use crate::local_mapping::LocalMapper;
use crate::loop_closing::{LoopCloser, LoopCloserConfig, LoopControl};
use crate::map::{KeyframeId, LandmarkId};
use crate::persistence::{self, LoadReport, PersistenceError};
use crate::tracking::{DepthImage, SensorInput, Tracker, TrackingFrontend, TrackingState};
use crate::vocabulary::Vocabulary;

use super::config::{Sensor, SystemConfig};
use super::shared_state::SharedState;
use super::worker::{LoopStage, StageControl, WorkerStage};

/// Capacity of the keyframe channels between the stages.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Poll interval while waiting for the mapping stage to park.
const MODE_POLL: Duration = Duration::from_millis(1);

/// Poll interval while waiting for stages to finish during shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

/// Pending mode-change requests, guarded by the mode lock.
#[derive(Default)]
struct ModeRequests {
    activate_localization: bool,
    deactivate_localization: bool,
}

/// Which mode change to apply during the current frame.
enum ModeChange {
    Activate,
    Deactivate,
}

/// Published per-frame tracking results, guarded by the state lock.
#[derive(Default, Clone)]
struct TrackingSnapshot {
    state: TrackingState,
    tracked_landmarks: Vec<Option<LandmarkId>>,
    tracked_keypoints: Vec<KeyPoint>,
}

/// The top-level SLAM system.
pub struct SlamSystem {
    sensor: Sensor,
    shared: Arc<SharedState>,
    vocabulary: Option<Arc<Vocabulary>>,

    tracker: Box<dyn TrackingFrontend>,

    mapping: Arc<dyn WorkerStage>,
    loop_closing: Arc<dyn LoopStage>,
    viewer: Option<Arc<dyn WorkerStage>>,
    mapping_handle: Option<JoinHandle<()>>,
    loop_handle: Option<JoinHandle<()>>,

    mode: Mutex<ModeRequests>,
    reset_requested: Mutex<bool>,
    snapshot: Mutex<TrackingSnapshot>,

    /// High-water mark for `map_changed`.
    seen_map_version: AtomicU64,

    shut_down: bool,
}

impl SlamSystem {
    /// Construct the system and spawn the background stages.
    ///
    /// A configured vocabulary that fails to load is a deployment defect and
    /// terminates the process.
    pub fn new(config: SystemConfig) -> Result<Self> {
        let vocabulary = match &config.vocabulary_path {
            Some(path) => match Vocabulary::load(path) {
                Ok(vocab) => {
                    info!(path = %path.display(), bytes = vocab.size_bytes(), "vocabulary loaded");
                    Some(Arc::new(vocab))
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "cannot load vocabulary");
                    std::process::exit(1);
                }
            },
            None => None,
        };

        let shared = SharedState::new();

        let (kf_sender, kf_receiver) = bounded::<KeyframeId>(KEYFRAME_CHANNEL_CAPACITY);
        let (lc_sender, lc_receiver) = bounded::<KeyframeId>(KEYFRAME_CHANNEL_CAPACITY);

        let mapping_control = Arc::new(StageControl::new());
        let mapping_handle = {
            let mut mapper = LocalMapper::new(
                Arc::clone(&shared),
                Arc::clone(&mapping_control),
                Some(lc_sender),
            );
            thread::spawn(move || mapper.run(kf_receiver))
        };

        let loop_control = Arc::new(LoopControl::new());
        let loop_handle = {
            let mut closer = LoopCloser::new(
                Arc::clone(&shared),
                Arc::clone(&loop_control),
                LoopCloserConfig::default(),
            );
            thread::spawn(move || closer.run(lc_receiver))
        };

        let tracker = Box::new(Tracker::new(
            Arc::clone(&shared),
            kf_sender,
            config.keyframe_interval,
        ));

        let system = Self {
            sensor: config.sensor,
            shared,
            vocabulary,
            tracker,
            mapping: mapping_control,
            loop_closing: loop_control,
            viewer: None,
            mapping_handle: Some(mapping_handle),
            loop_handle: Some(loop_handle),
            mode: Mutex::new(ModeRequests::default()),
            reset_requested: Mutex::new(false),
            snapshot: Mutex::new(TrackingSnapshot::default()),
            seen_map_version: AtomicU64::new(0),
            shut_down: false,
        };

        if config.start_in_localization_mode {
            if let Some(path) = &config.map_path {
                match system.load_map(path) {
                    Ok(Some(report)) => {
                        info!(
                            keyframes = report.keyframes_inserted,
                            landmarks = report.landmarks_inserted,
                            "startup map loaded"
                        );
                        system.activate_localization_mode();
                    }
                    Ok(None) => warn!("no startup map found, mapping from scratch"),
                    Err(e) => warn!(error = %e, "startup map unusable, mapping from scratch"),
                }
            }
        }

        Ok(system)
    }

    /// Assemble a system around externally provided collaborators.
    /// No threads are spawned; used by the protocol tests.
    #[cfg(test)]
    pub(crate) fn with_collaborators(
        sensor: Sensor,
        shared: Arc<SharedState>,
        tracker: Box<dyn TrackingFrontend>,
        mapping: Arc<dyn WorkerStage>,
        loop_closing: Arc<dyn LoopStage>,
    ) -> Self {
        Self {
            sensor,
            shared,
            vocabulary: None,
            tracker,
            mapping,
            loop_closing,
            viewer: None,
            mapping_handle: None,
            loop_handle: None,
            mode: Mutex::new(ModeRequests::default()),
            reset_requested: Mutex::new(false),
            snapshot: Mutex::new(TrackingSnapshot::default()),
            seen_map_version: AtomicU64::new(0),
            shut_down: false,
        }
    }

    /// Attach an externally driven viewer stage; shutdown will wait for it.
    pub fn attach_viewer(&mut self, viewer: Arc<dyn WorkerStage>) {
        self.viewer = Some(viewer);
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn vocabulary(&self) -> Option<&Arc<Vocabulary>> {
        self.vocabulary.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mode and reset requests (any thread, non-blocking, idempotent)
    // ─────────────────────────────────────────────────────────────────────

    /// Request localization-only mode; applied on the next frame.
    pub fn activate_localization_mode(&self) {
        self.mode.lock().activate_localization = true;
    }

    /// Request a return to full mapping mode; applied on the next frame.
    pub fn deactivate_localization_mode(&self) {
        self.mode.lock().deactivate_localization = true;
    }

    /// Request a tracking reset; applied on the next frame.
    pub fn request_reset(&self) {
        *self.reset_requested.lock() = true;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame entry points
    // ─────────────────────────────────────────────────────────────────────

    /// Process a monocular frame. Fatal if the system was configured for a
    /// different sensor.
    pub fn track_monocular(&mut self, image: GrayImage, timestamp: f64) -> SE3 {
        if self.sensor != Sensor::Monocular {
            error!(
                configured = %self.sensor,
                "track_monocular called but the input sensor is not monocular"
            );
            std::process::exit(1);
        }
        self.track(SensorInput::Monocular { image }, timestamp)
    }

    /// Process a stereo pair. Fatal if the system was configured for a
    /// different sensor.
    pub fn track_stereo(&mut self, left: GrayImage, right: GrayImage, timestamp: f64) -> SE3 {
        if self.sensor != Sensor::Stereo {
            error!(
                configured = %self.sensor,
                "track_stereo called but the input sensor is not stereo"
            );
            std::process::exit(1);
        }
        self.track(SensorInput::Stereo { left, right }, timestamp)
    }

    /// Process an RGB-D frame. Fatal if the system was configured for a
    /// different sensor.
    pub fn track_rgbd(&mut self, image: GrayImage, depth: DepthImage, timestamp: f64) -> SE3 {
        if self.sensor != Sensor::Rgbd {
            error!(
                configured = %self.sensor,
                "track_rgbd called but the input sensor is not rgbd"
            );
            std::process::exit(1);
        }
        self.track(SensorInput::Rgbd { image, depth }, timestamp)
    }

    fn track(&mut self, input: SensorInput, timestamp: f64) -> SE3 {
        // Decide and clear the pending mode change under the lock; apply it
        // outside so the lock is never held across the stop-wait.
        let change = {
            let mut mode = self.mode.lock();
            if mode.activate_localization {
                mode.activate_localization = false;
                Some(ModeChange::Activate)
            } else if mode.deactivate_localization {
                mode.deactivate_localization = false;
                Some(ModeChange::Deactivate)
            } else {
                None
            }
        };
        match change {
            Some(ModeChange::Activate) => {
                self.mapping.request_stop();
                // The stage may be mid-operation; wait until it has actually
                // parked before freezing the map.
                while !self.mapping.is_stopped() {
                    thread::sleep(MODE_POLL);
                }
                self.tracker.set_localization_only(true);
            }
            Some(ModeChange::Deactivate) => {
                self.tracker.set_localization_only(false);
                self.mapping.release();
            }
            None => {}
        }

        let do_reset = {
            let mut reset = self.reset_requested.lock();
            std::mem::take(&mut *reset)
        };
        if do_reset {
            self.tracker.reset();
        }

        let result = self.tracker.process_frame(input, timestamp);

        {
            let mut snapshot = self.snapshot.lock();
            snapshot.state = result.state;
            snapshot.tracked_landmarks = result.tracked_landmarks;
            snapshot.tracked_keypoints = result.tracked_keypoints;
        }
        result.pose
    }

    // ─────────────────────────────────────────────────────────────────────
    // Published state (any thread)
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_tracking_state(&self) -> TrackingState {
        self.snapshot.lock().state
    }

    pub fn get_tracked_landmarks(&self) -> Vec<Option<LandmarkId>> {
        self.snapshot.lock().tracked_landmarks.clone()
    }

    pub fn get_tracked_keypoints(&self) -> Vec<KeyPoint> {
        self.snapshot.lock().tracked_keypoints.clone()
    }

    /// Whether the map graph changed structurally since the last call.
    pub fn map_changed(&self) -> bool {
        let current = self.shared.map.read().structural_change_version();
        let seen = self.seen_map_version.load(Ordering::SeqCst);
        if current > seen {
            self.seen_map_version.store(current, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Serialize the map to `path` under a read lock (point-in-time snapshot).
    pub fn save_map(&self, path: &Path) -> Result<(), PersistenceError> {
        let map = self.shared.map.read();
        persistence::save_map(&map, path)
    }

    /// Load and reconstruct a map file. `Ok(None)` when no usable file
    /// exists; the system keeps its current (possibly empty) map.
    pub fn load_map(&self, path: &Path) -> Result<Option<LoadReport>, PersistenceError> {
        let Some((keyframes, landmarks)) = persistence::load_map(path)? else {
            return Ok(None);
        };
        let report = persistence::reconstruct(&self.shared, keyframes, landmarks);
        Ok(Some(report))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Trajectory export
    // ─────────────────────────────────────────────────────────────────────

    /// Export the per-frame trajectory (timestamp, translation, quaternion).
    /// Not available for monocular configurations.
    pub fn save_trajectory_tum(&self, path: &Path) -> std::io::Result<()> {
        if self.sensor == Sensor::Monocular {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "frame trajectory export is not available for monocular input",
            ));
        }
        let map = self.shared.map.read();
        trajectory::save_trajectory_tum(&map, self.tracker.trajectory(), path)
    }

    /// Export the keyframe trajectory (timestamp, translation, quaternion).
    pub fn save_keyframe_trajectory_tum(&self, path: &Path) -> std::io::Result<()> {
        let map = self.shared.map.read();
        trajectory::save_keyframe_trajectory_tum(&map, path)
    }

    /// Export the per-frame trajectory as 3x4 pose matrices, one per line.
    /// Not available for monocular configurations.
    pub fn save_trajectory_kitti(&self, path: &Path) -> std::io::Result<()> {
        if self.sensor == Sensor::Monocular {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "frame trajectory export is not available for monocular input",
            ));
        }
        let map = self.shared.map.read();
        trajectory::save_trajectory_kitti(&map, self.tracker.trajectory(), path)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Terminate all background stages and block until they report finished
    /// and no global optimization is in flight.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        info!("shutting down");

        self.mapping.request_finish();
        self.loop_closing.request_finish();

        if let Some(viewer) = &self.viewer {
            viewer.request_finish();
            while !viewer.is_finished() {
                thread::sleep(SHUTDOWN_POLL);
            }
        }

        // A global optimization still mutating the map must complete before
        // shutdown is allowed to finish.
        while !self.mapping.is_finished()
            || !self.loop_closing.is_finished()
            || self.loop_closing.is_global_optimization_running()
        {
            thread::sleep(SHUTDOWN_POLL);
        }

        if let Some(handle) = self.mapping_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
        self.shut_down = true;
        info!("all stages finished");
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
