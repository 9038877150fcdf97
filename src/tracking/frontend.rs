//! Tracking front-end interface.
//!
//! The orchestrator drives tracking purely through [`TrackingFrontend`]; the
//! feature extraction, matching and pose estimation behind it are
//! interchangeable. The trait also exposes the per-frame trajectory log the
//! export helpers consume.

use image::{GrayImage, ImageBuffer, Luma};

use crate::features::KeyPoint;
use crate::geometry::SE3;
use crate::map::{KeyframeId, LandmarkId};

use super::state::TrackingState;

/// Depth image: one u16 depth value per pixel.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// One frame of sensor data, per configured modality.
pub enum SensorInput {
    Monocular {
        image: GrayImage,
    },
    Stereo {
        left: GrayImage,
        right: GrayImage,
    },
    Rgbd {
        image: GrayImage,
        depth: DepthImage,
    },
}

/// What tracking produced for one frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    /// Estimated camera-to-world pose.
    pub pose: SE3,
    /// Tracking state after this frame.
    pub state: TrackingState,
    /// Per-keypoint landmark matches of the current frame.
    pub tracked_landmarks: Vec<Option<LandmarkId>>,
    /// Undistorted keypoints of the current frame.
    pub tracked_keypoints: Vec<KeyPoint>,
}

/// One entry of the per-frame trajectory log.
///
/// Frame poses are stored relative to a reference keyframe so that later
/// graph optimization of the keyframes transparently corrects the exported
/// trajectory. If the reference keyframe is flagged bad by the time the
/// trajectory is read, consumers walk up the spanning tree accumulating
/// each bad keyframe's pose-in-parent.
#[derive(Debug, Clone)]
pub struct TrajectoryEntry {
    pub reference: KeyframeId,
    pub timestamp: f64,
    pub lost: bool,
    /// Pose of the frame expressed in the reference keyframe's frame.
    pub pose_in_reference: SE3,
}

/// Append-only log of per-frame trajectory entries.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryLog {
    pub entries: Vec<TrajectoryEntry>,
}

impl TrajectoryLog {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The tracking collaborator interface consumed by the orchestrator.
pub trait TrackingFrontend: Send {
    /// Process one frame and return the pose estimate plus per-frame state.
    fn process_frame(&mut self, input: SensorInput, timestamp: f64) -> FrameResult;

    /// Freeze or unfreeze the map: when enabled, tracking localizes against
    /// the existing map and must not create keyframes or landmarks.
    fn set_localization_only(&mut self, enabled: bool);

    /// Drop internal trajectory/state and start over on the next frame.
    fn reset(&mut self);

    /// Current tracking state.
    fn state(&self) -> TrackingState;

    /// The per-frame trajectory log (read by trajectory export).
    fn trajectory(&self) -> &TrajectoryLog;
}
