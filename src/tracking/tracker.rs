//! Tracker - minimal tracking front-end.
//!
//! This implementation carries the bookkeeping the orchestrator and the
//! trajectory export depend on (state machine, reference keyframes, relative
//! pose log, keyframe insertion cadence) while delegating actual pose
//! estimation: the pose advances by a constant motion model only. A
//! feature-based front-end slots in behind the same [`TrackingFrontend`]
//! trait without touching the rest of the system.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::features::{DenseMatrix, KeyPoint, MatDepth};
use crate::geometry::SE3;
use crate::map::KeyframeId;
use crate::system::SharedState;

use super::frontend::{FrameResult, SensorInput, TrackingFrontend, TrajectoryEntry, TrajectoryLog};
use super::state::TrackingState;

/// Minimal tracking front-end.
pub struct Tracker {
    shared: Arc<SharedState>,

    /// Channel to the mapping stage; new keyframe ids are pushed here.
    kf_sender: Sender<KeyframeId>,

    state: TrackingState,

    /// When true the map is frozen: localize only, insert nothing.
    localization_only: bool,

    /// Last pose estimate (constant motion model).
    last_pose: SE3,

    /// Reference keyframe for relative-pose bookkeeping.
    reference: Option<KeyframeId>,

    frames_since_keyframe: usize,

    /// Insert a keyframe every this many frames while mapping.
    keyframe_interval: usize,

    trajectory: TrajectoryLog,
}

impl Tracker {
    pub fn new(
        shared: Arc<SharedState>,
        kf_sender: Sender<KeyframeId>,
        keyframe_interval: usize,
    ) -> Self {
        Self {
            shared,
            kf_sender,
            state: TrackingState::NotInitialized,
            localization_only: false,
            last_pose: SE3::identity(),
            reference: None,
            frames_since_keyframe: 0,
            keyframe_interval: keyframe_interval.max(1),
            trajectory: TrajectoryLog::default(),
        }
    }

    /// Create a keyframe from the current frame and hand it to the mapping
    /// stage.
    fn insert_keyframe(
        &mut self,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: DenseMatrix,
    ) -> KeyframeId {
        let kf_id = {
            let mut map = self.shared.map.write();
            map.create_keyframe(timestamp, pose, keypoints, descriptors)
        };
        // Non-blocking: a full queue just delays the handoff to the next
        // keyframe decision.
        if self.kf_sender.try_send(kf_id).is_err() {
            debug!(%kf_id, "mapping queue full, keyframe not forwarded");
        }
        self.reference = Some(kf_id);
        self.frames_since_keyframe = 0;
        kf_id
    }

    fn should_insert_keyframe(&self) -> bool {
        !self.localization_only
            && !self.shared.keyframe_creation_paused()
            && self.frames_since_keyframe >= self.keyframe_interval
    }

    fn log_frame(&mut self, timestamp: f64, pose: SE3) {
        let Some(reference) = self.reference else {
            return;
        };
        let ref_pose = self
            .shared
            .map
            .read()
            .keyframe(reference)
            .map(|kf| kf.pose)
            .unwrap_or_else(SE3::identity);
        self.trajectory.entries.push(TrajectoryEntry {
            reference,
            timestamp,
            lost: matches!(self.state, TrackingState::Lost),
            pose_in_reference: ref_pose.inverse() * pose,
        });
    }
}

impl TrackingFrontend for Tracker {
    fn process_frame(&mut self, _input: SensorInput, timestamp: f64) -> FrameResult {
        let pose = self.last_pose;

        match self.state {
            TrackingState::NotInitialized => {
                if !self.localization_only {
                    let kf_id = self.insert_keyframe(
                        timestamp,
                        pose,
                        Vec::new(),
                        DenseMatrix::zeros(0, 32, MatDepth::U8),
                    );
                    info!(%kf_id, "map initialized");
                    self.state = TrackingState::Ok;
                }
            }
            TrackingState::Ok | TrackingState::RecentlyLost => {
                self.frames_since_keyframe += 1;
                if self.should_insert_keyframe() {
                    let kf_id = self.insert_keyframe(
                        timestamp,
                        pose,
                        Vec::new(),
                        DenseMatrix::zeros(0, 32, MatDepth::U8),
                    );
                    debug!(%kf_id, "keyframe inserted");
                }
                self.state = TrackingState::Ok;
            }
            TrackingState::Lost => {}
        }

        self.last_pose = pose;
        self.log_frame(timestamp, pose);

        FrameResult {
            pose,
            state: self.state,
            tracked_landmarks: Vec::new(),
            tracked_keypoints: Vec::new(),
        }
    }

    fn set_localization_only(&mut self, enabled: bool) {
        if self.localization_only != enabled {
            info!(enabled, "localization-only mode");
        }
        self.localization_only = enabled;
    }

    fn reset(&mut self) {
        info!("tracking reset");
        self.trajectory.clear();
        self.state = TrackingState::NotInitialized;
        self.reference = None;
        self.last_pose = SE3::identity();
        self.frames_since_keyframe = 0;
    }

    fn state(&self) -> TrackingState {
        self.state
    }

    fn trajectory(&self) -> &TrajectoryLog {
        &self.trajectory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use image::GrayImage;

    fn frame() -> SensorInput {
        SensorInput::Monocular {
            image: GrayImage::new(4, 4),
        }
    }

    #[test]
    fn test_first_frame_initializes_map() {
        let shared = SharedState::new();
        let (tx, rx) = bounded(8);
        let mut tracker = Tracker::new(shared.clone(), tx, 5);

        let result = tracker.process_frame(frame(), 0.0);
        assert_eq!(result.state, TrackingState::Ok);
        assert_eq!(shared.map.read().num_keyframes(), 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_keyframe_cadence() {
        let shared = SharedState::new();
        let (tx, rx) = bounded(32);
        let mut tracker = Tracker::new(shared.clone(), tx, 3);

        for i in 0..10 {
            tracker.process_frame(frame(), i as f64 * 0.1);
        }
        // 1 initial keyframe + one every 3 frames.
        assert_eq!(shared.map.read().num_keyframes(), 4);
        assert_eq!(rx.len(), 4);
        assert_eq!(tracker.trajectory().len(), 10);
    }

    #[test]
    fn test_localization_only_blocks_insertion() {
        let shared = SharedState::new();
        let (tx, _rx) = bounded(32);
        let mut tracker = Tracker::new(shared.clone(), tx, 1);

        tracker.process_frame(frame(), 0.0);
        tracker.set_localization_only(true);
        for i in 1..5 {
            tracker.process_frame(frame(), i as f64 * 0.1);
        }
        assert_eq!(shared.map.read().num_keyframes(), 1);

        tracker.set_localization_only(false);
        tracker.process_frame(frame(), 1.0);
        assert_eq!(shared.map.read().num_keyframes(), 2);
    }

    #[test]
    fn test_reset_clears_trajectory() {
        let shared = SharedState::new();
        let (tx, _rx) = bounded(32);
        let mut tracker = Tracker::new(shared, tx, 5);

        tracker.process_frame(frame(), 0.0);
        tracker.process_frame(frame(), 0.1);
        assert!(!tracker.trajectory().is_empty());

        tracker.reset();
        assert!(tracker.trajectory().is_empty());
        assert_eq!(tracker.state(), TrackingState::NotInitialized);
    }
}
