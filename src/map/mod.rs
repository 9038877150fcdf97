//! Map module - core SLAM map data structures.
//!
//! This module contains:
//! - [`Keyframe`] - retained frames with poses and feature observations
//! - [`Landmark`] - 3D map points observed by keyframes
//! - [`WorldMap`] - the arena container managing both and their relationships
//! - [`KeyframeDatabase`] - the place-recognition lookup index
//!
//! # Architecture
//!
//! The map forms a bipartite graph:
//! - keyframes reference landmarks through observation slots
//! - landmarks track their observers (keyframe id -> slot)
//!
//! Keyframes additionally maintain two graph structures:
//! - **covisibility graph**: edges weighted by shared landmark count
//! - **spanning tree**: minimal connected structure used as a connectivity
//!   fallback when keyframes are flagged bad
//!
//! Entities are owned exclusively by the [`WorldMap`] arenas and referenced
//! everywhere else by id; flagging an entity bad never removes it from
//! storage, so stale back-references stay resolvable.

pub mod keyframe;
pub mod keyframe_db;
pub mod landmark;
pub mod types;
pub mod world_map;

pub use keyframe::Keyframe;
pub use keyframe_db::{bow_from_descriptors, BowVector, KeyframeDatabase};
pub use landmark::Landmark;
pub use types::{KeyframeId, LandmarkId};
pub use world_map::WorldMap;
