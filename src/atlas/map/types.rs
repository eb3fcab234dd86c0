//! Core ID types for the Atlas map structures.

/// Unique identifier for a KeyFrame within a Map.
///
/// KeyFrameIds are assigned sequentially when KeyFrames are created, so the
/// ordering of ids is the insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// Create a new KeyFrameId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint within a Map.
///
/// MapPointIds are assigned sequentially and never reused, so an id held by
/// the tracker after the point was culled simply fails to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    /// Create a new MapPointId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality() {
        let id1 = KeyFrameId::new(42);
        let id2 = KeyFrameId::new(42);
        let id3 = KeyFrameId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_mappoint_id_display() {
        let id = MapPointId::new(123);
        assert_eq!(format!("{}", id), "MP123");
    }

    #[test]
    fn test_ids_order_by_creation() {
        let mut ids = vec![KeyFrameId::new(7), KeyFrameId::new(2), KeyFrameId::new(5)];
        ids.sort();
        assert_eq!(ids, vec![KeyFrameId::new(2), KeyFrameId::new(5), KeyFrameId::new(7)]);
        assert!(MapPointId::new(1) < MapPointId::new(10));
    }
}
