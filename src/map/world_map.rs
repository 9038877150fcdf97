//! WorldMap - container for keyframes and landmarks.
//!
//! The map owns every keyframe and landmark for the lifetime of the process;
//! all cross-references between entities are ids resolved through the map's
//! arenas. Entities are never physically removed - flagging them bad keeps
//! the back-references held by other entities resolvable, and consumers
//! filter on the flag.
//!
//! Besides storage, the map maintains the two derived graph structures:
//! - the covisibility graph (symmetric, weighted by shared observations)
//! - the spanning tree (parent/child edges, rooted at the lowest id)

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::features::{hamming_distance, DenseMatrix, KeyPoint};
use crate::geometry::SE3;

use super::keyframe::Keyframe;
use super::landmark::Landmark;
use super::types::{KeyframeId, LandmarkId};

/// The shared world map.
pub struct WorldMap {
    keyframes: HashMap<KeyframeId, Keyframe>,
    landmarks: HashMap<LandmarkId, Landmark>,

    next_kf_id: u64,
    next_lm_id: u64,

    /// Most recently created keyframe; new keyframes hang off it in the
    /// spanning tree.
    last_keyframe: Option<KeyframeId>,

    /// Detector pyramid parameters used for landmark viewing bounds.
    scale_factor: f64,
    num_levels: u32,

    /// Monotonic counter bumped on structural changes (entities flagged bad,
    /// reconstruction). Readers compare against a remembered value to detect
    /// that the map graph changed underneath them.
    structural_version: u64,
}

impl WorldMap {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            landmarks: HashMap::new(),
            next_kf_id: 0,
            next_lm_id: 0,
            last_keyframe: None,
            scale_factor: 1.2,
            num_levels: 8,
            structural_version: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Structural change tracking
    // ─────────────────────────────────────────────────────────────────────

    pub fn structural_change_version(&self) -> u64 {
        self.structural_version
    }

    pub fn note_structural_change(&mut self) {
        self.structural_version += 1;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keyframe storage
    // ─────────────────────────────────────────────────────────────────────

    /// Create a new keyframe and link it into the spanning tree under the
    /// previously created keyframe.
    pub fn create_keyframe(
        &mut self,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: DenseMatrix,
    ) -> KeyframeId {
        let id = KeyframeId::new(self.next_kf_id);
        self.next_kf_id += 1;

        let mut kf = Keyframe::new(id, timestamp, pose, keypoints, descriptors);
        if let Some(prev_id) = self.last_keyframe {
            kf.set_parent(prev_id);
            if let Some(prev) = self.keyframes.get_mut(&prev_id) {
                prev.add_child(id);
            }
        }

        self.keyframes.insert(id, kf);
        self.last_keyframe = Some(id);
        id
    }

    /// Register an existing keyframe. Idempotent by id: a keyframe that is
    /// already present is left untouched.
    pub fn add_keyframe(&mut self, kf: Keyframe) {
        if kf.id.0 >= self.next_kf_id {
            self.next_kf_id = kf.id.0 + 1;
        }
        self.keyframes.entry(kf.id).or_insert(kf);
    }

    pub fn contains_keyframe(&self, id: KeyframeId) -> bool {
        self.keyframes.contains_key(&id)
    }

    pub fn keyframe(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyframeId) -> Option<&mut Keyframe> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// All keyframes in ascending id order - the canonical ordering for
    /// serialization and trajectory export.
    pub fn all_keyframes_sorted(&self) -> Vec<&Keyframe> {
        let mut kfs: Vec<&Keyframe> = self.keyframes.values().collect();
        kfs.sort_by_key(|kf| kf.id);
        kfs
    }

    /// The designated spanning-tree root: the lowest keyframe id.
    pub fn root_id(&self) -> Option<KeyframeId> {
        self.keyframes.keys().min().copied()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Landmark storage
    // ─────────────────────────────────────────────────────────────────────

    /// Create a new landmark.
    pub fn create_landmark(
        &mut self,
        position: Vector3<f64>,
        descriptor: DenseMatrix,
        first_keyframe: KeyframeId,
    ) -> LandmarkId {
        let id = LandmarkId::new(self.next_lm_id);
        self.next_lm_id += 1;
        self.landmarks
            .insert(id, Landmark::new(id, position, descriptor, first_keyframe));
        id
    }

    /// Register an existing landmark. Idempotent by id.
    pub fn add_landmark(&mut self, lm: Landmark) {
        if lm.id.0 >= self.next_lm_id {
            self.next_lm_id = lm.id.0 + 1;
        }
        self.landmarks.entry(lm.id).or_insert(lm);
    }

    pub fn contains_landmark(&self, id: LandmarkId) -> bool {
        self.landmarks.contains_key(&id)
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    /// All landmarks in ascending id order. The serialized format treats the
    /// landmark section as unordered; sorting keeps the output deterministic.
    pub fn all_landmarks_sorted(&self) -> Vec<&Landmark> {
        let mut lms: Vec<&Landmark> = self.landmarks.values().collect();
        lms.sort_by_key(|lm| lm.id);
        lms
    }

    // ─────────────────────────────────────────────────────────────────────
    // Association (keyframe <-> landmark)
    // ─────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a keyframe slot and a
    /// landmark, incrementally updating covisibility with every other
    /// observer. Returns false if either entity is missing.
    pub fn associate(&mut self, kf_id: KeyframeId, slot: usize, lm_id: LandmarkId) -> bool {
        let existing_observers: Vec<KeyframeId> = match self.landmarks.get(&lm_id) {
            Some(lm) => lm.observations.keys().copied().collect(),
            None => return false,
        };

        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.add_observation(kf_id, slot);
        }
        match self.keyframes.get_mut(&kf_id) {
            Some(kf) => {
                kf.set_landmark(slot, lm_id);
            }
            None => return false,
        }

        for other_id in existing_observers {
            if other_id == kf_id {
                continue;
            }
            let weight = self
                .keyframes
                .get(&other_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_id, weight);
            }
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.add_covisibility(kf_id, weight);
            }
        }

        true
    }

    /// Remove the association held by a keyframe slot, decrementing
    /// covisibility with the remaining observers.
    pub fn disassociate(&mut self, kf_id: KeyframeId, slot: usize) -> Option<LandmarkId> {
        let lm_id = self.keyframes.get(&kf_id)?.landmark_at(slot)?;

        let other_observers: Vec<KeyframeId> = self
            .landmarks
            .get(&lm_id)
            .map(|lm| {
                lm.observations
                    .keys()
                    .filter(|&&id| id != kf_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.clear_landmark(slot);
        }
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.erase_observation(kf_id);
        }

        for other_id in other_observers {
            let weight = self
                .keyframes
                .get(&other_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0);
            if weight <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_id);
                }
                if let Some(other) = self.keyframes.get_mut(&other_id) {
                    other.erase_covisibility(kf_id);
                }
            } else {
                let weight = weight - 1;
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.add_covisibility(other_id, weight);
                }
                if let Some(other) = self.keyframes.get_mut(&other_id) {
                    other.add_covisibility(kf_id, weight);
                }
            }
        }

        Some(lm_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Logical deletion
    // ─────────────────────────────────────────────────────────────────────

    /// Flag a keyframe bad. The entity stays in storage; its graph edges are
    /// stripped, its children are reparented to its own parent, and its pose
    /// relative to the parent is recorded for later traversal.
    ///
    /// The spanning-tree root is never flagged.
    pub fn set_keyframe_bad(&mut self, kf_id: KeyframeId) {
        if Some(kf_id) == self.root_id() {
            debug!(%kf_id, "ignoring bad flag for the spanning tree root");
            return;
        }
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        if kf.is_bad {
            return;
        }

        let parent = kf.parent;
        let children: Vec<KeyframeId> = kf.children.iter().copied().collect();
        let neighbors: Vec<KeyframeId> = kf.covisible_ids().copied().collect();
        let observed: Vec<(usize, LandmarkId)> = kf.observed_landmarks().collect();
        let pose = kf.pose;

        let pose_in_parent = parent
            .and_then(|p| self.keyframes.get(&p))
            .map(|pkf| pkf.pose.inverse() * pose);

        for (_, lm_id) in observed {
            if let Some(lm) = self.landmarks.get_mut(&lm_id) {
                lm.erase_observation(kf_id);
            }
        }
        for n in neighbors {
            if let Some(other) = self.keyframes.get_mut(&n) {
                other.erase_covisibility(kf_id);
            }
        }

        if let Some(p) = parent {
            for child_id in &children {
                if let Some(child) = self.keyframes.get_mut(child_id) {
                    child.set_parent(p);
                }
                if let Some(pkf) = self.keyframes.get_mut(&p) {
                    pkf.add_child(*child_id);
                }
            }
            if let Some(pkf) = self.keyframes.get_mut(&p) {
                pkf.erase_child(kf_id);
            }
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.children.clear();
            kf.replace_covisibility(HashMap::new());
            kf.pose_in_parent = pose_in_parent;
            kf.is_bad = true;
        }
        self.note_structural_change();
    }

    /// Flag a landmark bad: clear the slots of every observing keyframe and
    /// the landmark's own observation set, keep the entity in storage.
    pub fn set_landmark_bad(&mut self, lm_id: LandmarkId) {
        let Some(lm) = self.landmarks.get(&lm_id) else {
            return;
        };
        if lm.is_bad {
            return;
        }

        let observations: Vec<(KeyframeId, usize)> = lm
            .observations
            .iter()
            .map(|(&kf_id, &slot)| (kf_id, slot))
            .collect();

        for (kf_id, slot) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.clear_landmark(slot);
            }
        }
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.observations.clear();
            lm.is_bad = true;
        }
        self.note_structural_change();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Derived-structure maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute a keyframe's covisibility edges by counting shared non-bad
    /// landmark observations against every other keyframe, mirror the
    /// weights symmetrically, prune stale edges, and make sure the keyframe
    /// has a spanning-tree parent unless it is the root.
    ///
    /// Safe to re-run; repeated calls converge to the same graph.
    pub fn update_connections(&mut self, kf_id: KeyframeId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        if kf.is_bad {
            return;
        }

        let observed: Vec<LandmarkId> = kf.landmark_slots.iter().flatten().copied().collect();
        let old_neighbors: Vec<KeyframeId> = kf.covisible_ids().copied().collect();

        let mut counter: HashMap<KeyframeId, u32> = HashMap::new();
        for lm_id in observed {
            let Some(lm) = self.landmarks.get(&lm_id) else {
                continue;
            };
            if lm.is_bad {
                continue;
            }
            for &other_id in lm.observations.keys() {
                if other_id == kf_id {
                    continue;
                }
                if let Some(other) = self.keyframes.get(&other_id) {
                    if !other.is_bad {
                        *counter.entry(other_id).or_insert(0) += 1;
                    }
                }
            }
        }

        for n in old_neighbors {
            if !counter.contains_key(&n) {
                if let Some(other) = self.keyframes.get_mut(&n) {
                    other.erase_covisibility(kf_id);
                }
            }
        }
        for (&other_id, &weight) in &counter {
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.add_covisibility(kf_id, weight);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.replace_covisibility(counter.clone());
        }

        // Spanning-tree repair: a non-root keyframe whose parent is missing
        // or unresolvable adopts its strongest covisible neighbor of lower
        // id (keeps the tree acyclic), falling back to the root.
        let root = self.root_id();
        let needs_parent = self
            .keyframes
            .get(&kf_id)
            .map(|kf| match kf.parent {
                Some(p) => !self.keyframes.contains_key(&p),
                None => true,
            })
            .unwrap_or(false);
        if needs_parent && Some(kf_id) != root {
            let mut best: Option<(u32, KeyframeId)> = None;
            for (&other_id, &weight) in &counter {
                if other_id >= kf_id {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((bw, bid)) => weight > bw || (weight == bw && other_id < bid),
                };
                if better {
                    best = Some((weight, other_id));
                }
            }
            let parent = best.map(|(_, id)| id).or(root.filter(|&r| r != kf_id));
            if let Some(p) = parent {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_parent(p);
                }
                if let Some(pkf) = self.keyframes.get_mut(&p) {
                    pkf.add_child(kf_id);
                }
            }
        }
    }

    /// Recompute a landmark's representative descriptor: the observed
    /// descriptor row with the smallest median Hamming distance to all the
    /// others.
    pub fn update_landmark_descriptor(&mut self, lm_id: LandmarkId) {
        let Some(lm) = self.landmarks.get(&lm_id) else {
            return;
        };
        if lm.is_bad {
            return;
        }

        // Observers visited in id order so repeated recomputes (and reloads)
        // settle ties identically.
        let mut observations: Vec<(KeyframeId, usize)> =
            lm.observations.iter().map(|(&k, &s)| (k, s)).collect();
        observations.sort_unstable();

        let mut rows: Vec<Vec<u8>> = Vec::new();
        for (kf_id, slot) in observations {
            let Some(kf) = self.keyframes.get(&kf_id) else {
                continue;
            };
            if kf.is_bad {
                continue;
            }
            if let Some(row) = kf.descriptors.row_bytes(slot) {
                rows.push(row.to_vec());
            }
        }
        if rows.is_empty() {
            return;
        }

        let n = rows.len();
        let mut best_idx = 0;
        let mut best_median = u32::MAX;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| hamming_distance(&rows[i], &rows[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[n / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        let cols = rows[best_idx].len();
        let chosen = DenseMatrix::from_u8_rows(std::slice::from_ref(&rows[best_idx]), cols);
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.descriptor = chosen;
        }
    }

    /// Recompute a landmark's viewing normal and distance bounds from the
    /// camera centers of its current (non-bad) observers.
    pub fn update_landmark_geometry(&mut self, lm_id: LandmarkId) {
        let Some(lm) = self.landmarks.get(&lm_id) else {
            return;
        };
        if lm.is_bad {
            return;
        }

        let centers: Vec<Vector3<f64>> = lm
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id))
            .filter(|kf| !kf.is_bad)
            .map(|kf| kf.camera_center())
            .collect();

        let (scale_factor, num_levels) = (self.scale_factor, self.num_levels);
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.update_normal_and_depth(centers.iter(), scale_factor, num_levels);
        }
    }
}

impl Default for WorldMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorldMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldMap")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_landmarks", &self.landmarks.len())
            .finish()
    }
}
