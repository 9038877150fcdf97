//! Map reconstruction: from flat decoded entity lists to a query-ready map.
//!
//! Decoding leaves two flat lists whose entities still reference each other
//! only by id. Reconstruction re-registers everything into the shared map
//! and rebuilds the derived structures in three phases:
//!
//! 1. **Keyframe insertion** (worker thread, caller polls a finished flag):
//!    every live keyframe goes into the map and the place-recognition index;
//!    its observation slots are re-wired onto the referenced landmarks, which
//!    are registered on first contact.
//! 2. **Landmark finalization** (worker thread): remaining unobserved
//!    landmarks are registered, then every landmark's representative
//!    descriptor and viewing bounds are recomputed from the observation set
//!    phase 1 produced.
//! 3. **Connection rebuild** (caller thread, strictly after phase 1):
//!    covisibility weights are recounted from shared observations and the
//!    spanning tree is repaired for every inserted keyframe.
//!
//! Phases 2 and 3 run concurrently; both only need phase 1's output.
//! Entities that arrive null or flagged bad are skipped with a log line and
//! never counted as inserted - a partially intact file still yields a usable
//! map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::map::{bow_from_descriptors, Keyframe, KeyframeId, Landmark, LandmarkId};
use crate::system::SharedState;

/// Poll interval while waiting for the keyframe insertion thread.
const PHASE1_POLL: Duration = Duration::from_millis(5);

/// Counts reported after reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub keyframes_total: usize,
    pub keyframes_inserted: usize,
    pub landmarks_total: usize,
    pub landmarks_inserted: usize,
}

type LandmarkPool = Arc<Mutex<HashMap<LandmarkId, Landmark>>>;

/// Rebuild the shared map from decoded entity lists.
///
/// Blocks the caller until all phases complete.
pub fn reconstruct(
    shared: &Arc<SharedState>,
    keyframes: Vec<Option<Keyframe>>,
    landmarks: Vec<Option<Landmark>>,
) -> LoadReport {
    let keyframes_total = keyframes.len();
    let landmarks_total = landmarks.len();

    // Live landmarks wait in a pool until phase 1 pulls them into the map.
    let mut pool_map = HashMap::new();
    let mut live_landmark_ids = Vec::new();
    for entry in landmarks {
        match entry {
            Some(lm) if !lm.is_bad => {
                live_landmark_ids.push(lm.id);
                pool_map.insert(lm.id, lm);
            }
            Some(lm) => warn!(lm_id = %lm.id, "skipping bad landmark"),
            None => warn!("skipping invalidated landmark entry"),
        }
    }
    let landmarks_inserted = live_landmark_ids.len();
    let pool: LandmarkPool = Arc::new(Mutex::new(pool_map));

    // Phase 1: keyframe insertion on its own thread; the caller polls the
    // finished flag rather than blocking on the join, so a stuck insertion
    // shows up as a liveness problem instead of a silent hang.
    let inserted_count = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let phase1 = {
        let shared = Arc::clone(shared);
        let pool = Arc::clone(&pool);
        let inserted_count = Arc::clone(&inserted_count);
        let finished = Arc::clone(&finished);
        thread::spawn(move || insert_keyframes(&shared, &pool, keyframes, &inserted_count, &finished))
    };
    while !finished.load(Ordering::SeqCst) {
        thread::sleep(PHASE1_POLL);
    }
    let inserted_ids = match phase1.join() {
        Ok(ids) => ids,
        Err(_) => {
            error!("keyframe insertion thread panicked");
            Vec::new()
        }
    };
    let keyframes_inserted = inserted_count.load(Ordering::SeqCst);
    info!(
        inserted = keyframes_inserted,
        total = keyframes_total,
        "keyframes inserted"
    );

    // Phase 2: landmark finalization, concurrent with phase 3 below.
    let phase2 = {
        let shared = Arc::clone(shared);
        let pool = Arc::clone(&pool);
        let ids = live_landmark_ids;
        thread::spawn(move || finalize_landmarks(&shared, &pool, ids))
    };

    // Phase 3: connection rebuild, strictly after phase 1.
    for kf_id in &inserted_ids {
        shared.map.write().update_connections(*kf_id);
    }

    if phase2.join().is_err() {
        error!("landmark finalization thread panicked");
    }

    shared.map.write().note_structural_change();
    info!(landmarks = landmarks_inserted, "map reconstruction complete");

    LoadReport {
        keyframes_total,
        keyframes_inserted,
        landmarks_total,
        landmarks_inserted,
    }
}

/// Phase 1 body. Returns the ids actually inserted, in input order.
fn insert_keyframes(
    shared: &Arc<SharedState>,
    pool: &LandmarkPool,
    keyframes: Vec<Option<Keyframe>>,
    inserted_count: &AtomicUsize,
    finished: &AtomicBool,
) -> Vec<KeyframeId> {
    let mut inserted_ids = Vec::new();

    for entry in keyframes {
        let Some(mut kf) = entry else {
            warn!("skipping invalidated keyframe entry");
            continue;
        };
        if kf.is_bad {
            warn!(kf_id = %kf.id, "skipping bad keyframe");
            continue;
        }
        let kf_id = kf.id;
        let bow = bow_from_descriptors(&kf.descriptors);

        {
            let mut map = shared.map.write();
            for slot in 0..kf.landmark_slots.len() {
                let Some(lm_id) = kf.landmark_slots[slot] else {
                    continue;
                };
                if !map.contains_landmark(lm_id) {
                    if let Some(lm) = pool.lock().remove(&lm_id) {
                        map.add_landmark(lm);
                    }
                }
                match map.landmark_mut(lm_id) {
                    Some(lm) if !lm.is_bad => lm.add_observation(kf_id, slot),
                    _ => {
                        warn!(%kf_id, slot, "dropping reference to missing or bad landmark");
                        kf.landmark_slots[slot] = None;
                    }
                }
            }
            map.add_keyframe(kf);
        }
        shared.keyframe_db.write().add(kf_id, bow);

        inserted_ids.push(kf_id);
        inserted_count.fetch_add(1, Ordering::SeqCst);
    }

    finished.store(true, Ordering::SeqCst);
    inserted_ids
}

/// Phase 2 body.
fn finalize_landmarks(shared: &Arc<SharedState>, pool: &LandmarkPool, ids: Vec<LandmarkId>) {
    let remaining: Vec<Landmark> = {
        let mut pool = pool.lock();
        pool.drain().map(|(_, lm)| lm).collect()
    };
    if !remaining.is_empty() {
        debug!(
            count = remaining.len(),
            "registering landmarks with no surviving observations"
        );
        let mut map = shared.map.write();
        for lm in remaining {
            map.add_landmark(lm);
        }
    }

    for lm_id in ids {
        let mut map = shared.map.write();
        map.update_landmark_descriptor(lm_id);
        map.update_landmark_geometry(lm_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    use crate::features::{DenseMatrix, KeyPoint, MatDepth};
    use crate::geometry::SE3;

    fn make_keyframe(id: u64, slots: usize) -> Keyframe {
        Keyframe::new(
            KeyframeId::new(id),
            id as f64 * 0.1,
            SE3::identity(),
            vec![KeyPoint::default(); slots],
            DenseMatrix::zeros(slots, 32, MatDepth::U8),
        )
    }

    fn make_landmark(id: u64) -> Landmark {
        Landmark::new(
            LandmarkId::new(id),
            Vector3::new(id as f64, 0.0, 1.0),
            DenseMatrix::from_u8_rows(&[vec![id as u8; 32]], 32),
            KeyframeId::new(0),
        )
    }

    #[test]
    fn test_bad_and_null_entities_are_excluded() {
        let shared = SharedState::new();

        let mut bad_kf = make_keyframe(1, 0);
        bad_kf.is_bad = true;
        let keyframes = vec![
            Some(make_keyframe(0, 0)),
            Some(bad_kf),
            None,
            Some(make_keyframe(3, 0)),
        ];

        let mut bad_lm = make_landmark(10);
        bad_lm.is_bad = true;
        let landmarks = vec![Some(make_landmark(11)), Some(bad_lm), None];

        let report = reconstruct(&shared, keyframes, landmarks);

        assert_eq!(report.keyframes_total, 4);
        assert_eq!(report.keyframes_inserted, 2);
        assert_eq!(report.landmarks_total, 3);
        assert_eq!(report.landmarks_inserted, 1);

        let map = shared.map.read();
        assert_eq!(map.num_keyframes(), 2);
        assert!(map.contains_keyframe(KeyframeId::new(0)));
        assert!(map.contains_keyframe(KeyframeId::new(3)));
        assert_eq!(map.num_landmarks(), 1);
        assert!(map.contains_landmark(LandmarkId::new(11)));
    }

    #[test]
    fn test_dangling_slot_references_are_dropped() {
        let shared = SharedState::new();

        let mut kf = make_keyframe(0, 2);
        kf.landmark_slots[0] = Some(LandmarkId::new(50)); // never serialized
        let report = reconstruct(&shared, vec![Some(kf)], vec![]);

        assert_eq!(report.keyframes_inserted, 1);
        let map = shared.map.read();
        let kf = map.keyframe(KeyframeId::new(0)).unwrap();
        assert_eq!(kf.landmark_at(0), None);
    }

    #[test]
    fn test_reconstruction_rebuilds_connections() {
        let shared = SharedState::new();

        // Keyframes 0,1,2 in a parent chain; landmark 0 seen by {0,1},
        // landmark 1 by {1,2}.
        let mut kf0 = make_keyframe(0, 2);
        let mut kf1 = make_keyframe(1, 2);
        let mut kf2 = make_keyframe(2, 2);
        kf1.parent = Some(KeyframeId::new(0));
        kf2.parent = Some(KeyframeId::new(1));
        kf0.children.insert(KeyframeId::new(1));
        kf1.children.insert(KeyframeId::new(2));

        let mut lm0 = make_landmark(0);
        let mut lm1 = make_landmark(1);
        kf0.landmark_slots[0] = Some(lm0.id);
        kf1.landmark_slots[0] = Some(lm0.id);
        kf1.landmark_slots[1] = Some(lm1.id);
        kf2.landmark_slots[1] = Some(lm1.id);
        lm0.add_observation(kf0.id, 0);
        lm0.add_observation(kf1.id, 0);
        lm1.add_observation(kf1.id, 1);
        lm1.add_observation(kf2.id, 1);

        let report = reconstruct(
            &shared,
            vec![Some(kf0), Some(kf1), Some(kf2)],
            vec![Some(lm0), Some(lm1)],
        );
        assert_eq!(report.keyframes_inserted, 3);
        assert_eq!(report.landmarks_inserted, 2);

        let map = shared.map.read();
        let id = KeyframeId::new;
        assert_eq!(map.keyframe(id(0)).unwrap().covisibility_weight(id(1)), 1);
        assert_eq!(map.keyframe(id(1)).unwrap().covisibility_weight(id(2)), 1);
        assert_eq!(map.keyframe(id(0)).unwrap().covisibility_weight(id(2)), 0);
        assert_eq!(
            map.landmark(LandmarkId::new(0)).unwrap().num_observations(),
            2
        );
        assert_eq!(
            map.landmark(LandmarkId::new(1)).unwrap().num_observations(),
            2
        );

        // Every inserted keyframe is queryable through the index.
        assert_eq!(shared.keyframe_db.read().len(), 3);
    }

    #[test]
    fn test_unobserved_landmarks_are_still_registered() {
        let shared = SharedState::new();
        let report = reconstruct(&shared, vec![], vec![Some(make_landmark(7))]);
        assert_eq!(report.landmarks_inserted, 1);
        assert!(shared.map.read().contains_landmark(LandmarkId::new(7)));
    }
}
