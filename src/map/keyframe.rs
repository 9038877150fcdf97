//! Keyframe - a retained, pose-tagged snapshot used as a map-graph node.
//!
//! Keyframes carry the visual observations (keypoints + descriptors), the
//! landmark association slots, and the two graph structures the rest of the
//! system queries:
//! - the covisibility graph, weighted by shared landmark observations
//! - the spanning tree, used as a connectivity fallback once a keyframe is
//!   flagged bad

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::features::{DenseMatrix, KeyPoint};
use crate::geometry::SE3;

use super::types::{KeyframeId, LandmarkId};

/// A keyframe in the world map.
#[derive(Debug, Clone)]
pub struct Keyframe {
    /// Unique, monotonically assigned identifier.
    pub id: KeyframeId,

    /// Capture timestamp in seconds.
    pub timestamp: f64,

    /// Pose: camera-to-world transform (T_wc).
    pub pose: SE3,

    /// Detected keypoints.
    pub keypoints: Vec<KeyPoint>,

    /// Binary descriptors, one row per keypoint.
    pub descriptors: DenseMatrix,

    /// Observation slots: `landmark_slots[i]` is the landmark matched to
    /// keypoint `i`, if any.
    pub landmark_slots: Vec<Option<LandmarkId>>,

    /// Parent keyframe in the spanning tree. `None` for the root.
    pub parent: Option<KeyframeId>,

    /// Children keyframes in the spanning tree.
    pub children: HashSet<KeyframeId>,

    /// Pose of this keyframe expressed in its parent's frame, recorded when
    /// the keyframe is flagged bad so trajectory queries can walk past it.
    pub pose_in_parent: Option<SE3>,

    /// Logical-deletion flag. A bad keyframe stays in storage so that
    /// back-references held by other entities remain resolvable.
    pub is_bad: bool,

    /// Covisibility weights: connected keyframe -> shared landmark count.
    covisibility: HashMap<KeyframeId, u32>,

    /// Cached weight-descending neighbor list, rebuilt lazily.
    ordered_covisibles: Vec<(KeyframeId, u32)>,
    covisibility_dirty: bool,
}

impl Keyframe {
    pub fn new(
        id: KeyframeId,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: DenseMatrix,
    ) -> Self {
        let num_features = keypoints.len();
        Self {
            id,
            timestamp,
            pose,
            keypoints,
            descriptors,
            landmark_slots: vec![None; num_features],
            parent: None,
            children: HashSet::new(),
            pose_in_parent: None,
            is_bad: false,
            covisibility: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
        }
    }

    /// Camera position in the world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Landmark association slots
    // ─────────────────────────────────────────────────────────────────────

    /// Landmark associated with a given slot, if any.
    pub fn landmark_at(&self, slot: usize) -> Option<LandmarkId> {
        self.landmark_slots.get(slot).copied().flatten()
    }

    /// Associate a slot with a landmark, returning the previous association.
    pub fn set_landmark(&mut self, slot: usize, lm_id: LandmarkId) -> Option<LandmarkId> {
        if slot >= self.landmark_slots.len() {
            return None;
        }
        self.landmark_slots[slot].replace(lm_id)
    }

    /// Clear a slot's association.
    pub fn clear_landmark(&mut self, slot: usize) -> Option<LandmarkId> {
        if slot >= self.landmark_slots.len() {
            return None;
        }
        self.landmark_slots[slot].take()
    }

    /// All occupied slots as (slot index, landmark) pairs.
    pub fn observed_landmarks(&self) -> impl Iterator<Item = (usize, LandmarkId)> + '_ {
        self.landmark_slots
            .iter()
            .enumerate()
            .filter_map(|(idx, lm)| lm.map(|id| (idx, id)))
    }

    pub fn num_observed_landmarks(&self) -> usize {
        self.landmark_slots.iter().filter(|lm| lm.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────

    /// Insert or update a covisibility edge. Self-edges are ignored.
    pub fn add_covisibility(&mut self, kf_id: KeyframeId, weight: u32) {
        if kf_id == self.id {
            return;
        }
        self.covisibility.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    /// Remove a covisibility edge.
    pub fn erase_covisibility(&mut self, kf_id: KeyframeId) {
        if self.covisibility.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    /// Replace the whole adjacency map. Used when connections are recomputed
    /// from scratch; self-edges are dropped.
    pub fn replace_covisibility(&mut self, weights: HashMap<KeyframeId, u32>) {
        self.covisibility = weights;
        self.covisibility.remove(&self.id);
        self.covisibility_dirty = true;
    }

    /// Weight of the edge to another keyframe; 0 when not connected.
    pub fn covisibility_weight(&self, kf_id: KeyframeId) -> u32 {
        self.covisibility.get(&kf_id).copied().unwrap_or(0)
    }

    /// All connected keyframes, unordered.
    pub fn covisible_ids(&self) -> impl Iterator<Item = &KeyframeId> {
        self.covisibility.keys()
    }

    /// Read-only adjacency map.
    pub fn covisibility_weights(&self) -> &HashMap<KeyframeId, u32> {
        &self.covisibility
    }

    /// The N strongest covisible keyframes, best first.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyframeId> {
        self.ensure_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Covisible keyframes with at least `min_weight` shared landmarks.
    pub fn covisibles_above_weight(&mut self, min_weight: u32) -> Vec<KeyframeId> {
        self.ensure_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn ensure_ordered_covisibles(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self.covisibility.iter().map(|(id, w)| (*id, *w)).collect();
        // Weight descending; id ascending as tie-break for determinism.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spanning tree
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyframeId) {
        self.parent = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyframeId) {
        self.children.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyframeId) {
        self.children.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyframe(id: u64) -> Keyframe {
        Keyframe::new(
            KeyframeId::new(id),
            id as f64 * 0.1,
            SE3::identity(),
            vec![KeyPoint::default(); 10],
            DenseMatrix::zeros(10, 32, crate::features::MatDepth::U8),
        )
    }

    #[test]
    fn test_landmark_slot_association() {
        let mut kf = test_keyframe(1);

        kf.set_landmark(3, LandmarkId::new(100));
        assert_eq!(kf.landmark_at(3), Some(LandmarkId::new(100)));
        assert_eq!(kf.landmark_at(4), None);
        assert_eq!(kf.num_observed_landmarks(), 1);

        let prev = kf.set_landmark(3, LandmarkId::new(200));
        assert_eq!(prev, Some(LandmarkId::new(100)));

        let cleared = kf.clear_landmark(3);
        assert_eq!(cleared, Some(LandmarkId::new(200)));
        assert_eq!(kf.landmark_at(3), None);
    }

    #[test]
    fn test_out_of_range_slot_is_ignored() {
        let mut kf = test_keyframe(1);
        assert_eq!(kf.set_landmark(99, LandmarkId::new(1)), None);
        assert_eq!(kf.clear_landmark(99), None);
    }

    #[test]
    fn test_covisibility_ordering() {
        let mut kf = test_keyframe(1);

        kf.add_covisibility(KeyframeId::new(2), 50);
        kf.add_covisibility(KeyframeId::new(3), 100);
        kf.add_covisibility(KeyframeId::new(4), 25);

        assert_eq!(kf.covisibility_weight(KeyframeId::new(2)), 50);
        assert_eq!(kf.covisibility_weight(KeyframeId::new(9)), 0);

        let best = kf.best_covisibles(2);
        assert_eq!(best, vec![KeyframeId::new(3), KeyframeId::new(2)]);

        let above = kf.covisibles_above_weight(30);
        assert_eq!(above.len(), 2);
    }

    #[test]
    fn test_covisibility_rejects_self_edge() {
        let mut kf = test_keyframe(1);
        kf.add_covisibility(KeyframeId::new(1), 10);
        assert_eq!(kf.covisibility_weight(KeyframeId::new(1)), 0);

        let mut weights = HashMap::new();
        weights.insert(KeyframeId::new(1), 5);
        weights.insert(KeyframeId::new(2), 7);
        kf.replace_covisibility(weights);
        assert_eq!(kf.covisibility_weight(KeyframeId::new(1)), 0);
        assert_eq!(kf.covisibility_weight(KeyframeId::new(2)), 7);
    }

    #[test]
    fn test_spanning_tree_edges() {
        let mut kf1 = test_keyframe(1);
        let mut kf2 = test_keyframe(2);

        assert!(kf1.is_root());

        kf2.set_parent(KeyframeId::new(1));
        kf1.add_child(KeyframeId::new(2));

        assert!(!kf2.is_root());
        assert_eq!(kf2.parent, Some(KeyframeId::new(1)));
        assert!(kf1.children.contains(&KeyframeId::new(2)));

        kf1.erase_child(KeyframeId::new(2));
        assert!(kf1.children.is_empty());
    }
}
