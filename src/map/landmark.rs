//! Landmark - a 3D map point observed by keyframes.
//!
//! Landmarks record which keyframes observe them (and at which slot), carry a
//! representative descriptor for matching, and maintain viewing-geometry
//! bounds recomputed from the observation set.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::DenseMatrix;

use super::types::{KeyframeId, LandmarkId};

/// A 3D landmark observed by one or more keyframes.
#[derive(Debug, Clone)]
pub struct Landmark {
    /// Unique, monotonically assigned identifier.
    pub id: LandmarkId,

    /// 3D position in the world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor (single row), chosen from the observations.
    pub descriptor: DenseMatrix,

    /// Observing keyframes mapped to the observation slot in that keyframe.
    pub observations: HashMap<KeyframeId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Minimum distance at which the point is reliably observable.
    pub min_distance: f64,

    /// Maximum distance at which the point is reliably observable.
    pub max_distance: f64,

    /// Keyframe that first observed this landmark.
    pub first_keyframe: KeyframeId,

    /// Logical-deletion flag; a bad landmark stays in storage.
    pub is_bad: bool,
}

impl Landmark {
    pub fn new(
        id: LandmarkId,
        position: Vector3<f64>,
        descriptor: DenseMatrix,
        first_keyframe: KeyframeId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            first_keyframe,
            is_bad: false,
        }
    }

    /// Record an observation. Idempotent per keyframe: a repeated insert for
    /// the same keyframe just updates the slot.
    pub fn add_observation(&mut self, kf_id: KeyframeId, slot: usize) {
        self.observations.insert(kf_id, slot);
    }

    /// Remove an observation; returns whether it existed.
    pub fn erase_observation(&mut self, kf_id: KeyframeId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Recompute the mean viewing normal and the valid distance bounds from
    /// the positions of the observing cameras.
    ///
    /// `scale_factor` and `num_levels` describe the detector pyramid; the
    /// bounds are widened by the pyramid's full scale range.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        camera_centers: impl Iterator<Item = &'a Vector3<f64>>,
        scale_factor: f64,
        num_levels: u32,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut min_dist = f64::INFINITY;
        let mut max_dist = 0.0f64;

        for center in camera_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                min_dist = min_dist.min(dist);
                max_dist = max_dist.max(dist);
            }
        }

        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }
        if max_dist > 0.0 {
            let scale_range = scale_factor.powi(num_levels as i32 - 1);
            self.min_distance = min_dist / scale_range;
            self.max_distance = max_dist * scale_range;
        }
    }

    /// Whether a viewing distance falls inside the valid range.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }
}
