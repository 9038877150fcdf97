//! Tracking: the caller-driven frame processing path.
//!
//! Tracking turns raw frames into pose estimates and decides when to insert
//! keyframes. The orchestrator talks to it exclusively through the
//! [`TrackingFrontend`] trait so the estimation pipeline behind it can be
//! swapped without touching the coordination logic.

pub mod frontend;
pub mod state;
pub mod tracker;

pub use frontend::{
    DepthImage, FrameResult, SensorInput, TrackingFrontend, TrajectoryEntry, TrajectoryLog,
};
pub use state::TrackingState;
pub use tracker::Tracker;
