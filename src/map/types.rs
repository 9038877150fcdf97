//! Core ID types for the world map.

/// Unique identifier for a keyframe within the map.
///
/// Ids are assigned monotonically when keyframes are created and double as the
/// deterministic ordering key for trajectory export and serialization. They
/// serve as lightweight handles for cross-referencing without Arc/Rc, which
/// keeps the cyclic keyframe/landmark graph free of ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyframeId(pub u64);

impl KeyframeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a landmark (3D map point) within the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering() {
        assert!(KeyframeId::new(1) < KeyframeId::new(2));
        assert_eq!(KeyframeId::new(7), KeyframeId::new(7));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", KeyframeId::new(3)), "KF3");
        assert_eq!(format!("{}", LandmarkId::new(12)), "LM12");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<LandmarkId, &str> = HashMap::new();
        map.insert(LandmarkId::new(1), "first");
        assert_eq!(map.get(&LandmarkId::new(1)), Some(&"first"));
        assert_eq!(map.get(&LandmarkId::new(2)), None);
    }
}
