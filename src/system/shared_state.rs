//! Shared state between the tracking path and the background stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::map::{KeyframeDatabase, WorldMap};

/// State shared by tracking, mapping and loop closing.
///
/// The world map and the place-recognition index each sit behind their own
/// `RwLock`; the tracking path mostly reads, the background stages write.
pub struct SharedState {
    /// The world map: keyframes, landmarks, covisibility, spanning tree.
    pub map: RwLock<WorldMap>,

    /// Keyframe lookup index for place recognition.
    pub keyframe_db: RwLock<KeyframeDatabase>,

    /// Flow control: when true, tracking should not create new keyframes.
    /// Set by the mapping stage when its queue backs up.
    keyframe_creation_paused: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(WorldMap::new()),
            keyframe_db: RwLock::new(KeyframeDatabase::new()),
            keyframe_creation_paused: AtomicBool::new(false),
        })
    }

    pub fn keyframe_creation_paused(&self) -> bool {
        self.keyframe_creation_paused.load(Ordering::SeqCst)
    }

    pub fn set_keyframe_creation_paused(&self, value: bool) {
        self.keyframe_creation_paused.store(value, Ordering::SeqCst);
    }
}
