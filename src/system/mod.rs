//! System orchestration and thread management.
//!
//! This module contains the top-level [`SlamSystem`] that spawns and
//! coordinates the background stages, the shared state they operate on, the
//! cooperative [`WorkerStage`] control protocol, and the system
//! configuration.

pub mod config;
pub mod shared_state;
mod slam_system;
pub mod worker;

pub use config::{Sensor, SystemConfig};
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
pub use worker::{LoopStage, StageControl, WorkerStage};
