//! Atlas - the map store shared by tracking, local mapping and loop closing.
//!
//! The Atlas owns the active `Map` and the `KeyFrameDatabase` used for place
//! recognition (relocalization and loop detection). Operations that must
//! keep both in sync live here.

use crate::atlas::map::{KeyFrameId, Map};
use crate::features::ScalePyramid;

use super::keyframe_db::KeyFrameDatabase;

pub struct Atlas {
    pub map: Map,
    pub keyframe_db: KeyFrameDatabase,
}

impl Atlas {
    pub fn new(pyramid: ScalePyramid) -> Self {
        Self {
            map: Map::new(pyramid),
            keyframe_db: KeyFrameDatabase::new(),
        }
    }

    /// Register a KeyFrame's BoW vector for place recognition. No-op for a
    /// KeyFrame without BoW.
    pub fn register_keyframe(&mut self, kf_id: KeyFrameId) {
        if let Some(bow) = self.map.get_keyframe(kf_id).and_then(|kf| kf.bow_vector()) {
            self.keyframe_db.add(kf_id, bow);
        }
    }

    /// Remove a KeyFrame from the map and the database.
    pub fn remove_keyframe_full(&mut self, kf_id: KeyFrameId) {
        self.keyframe_db.erase(kf_id);
        self.map.remove_keyframe_full(kf_id);
    }

    /// Drop everything, e.g. after a failed initialization.
    pub fn clear(&mut self) {
        self.map.clear();
        self.keyframe_db.clear();
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new(ScalePyramid::default())
    }
}

impl std::fmt::Debug for Atlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atlas")
            .field("map", &self.map)
            .field("db_entries", &self.keyframe_db.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, FeatureSet, KeyPoint};
    use crate::geometry::SE3;
    use crate::vocabulary::BowVector;

    #[test]
    fn test_remove_keyframe_erases_database_entry() {
        let mut atlas = Atlas::default();
        let features = FeatureSet::new(vec![KeyPoint::new(1.0, 1.0)], vec![Descriptor::default()]);
        let kf = atlas.map.create_keyframe(0, 0.0, SE3::identity(), features, (640, 480));
        let bow: BowVector = [(3u32, 1.0)].into_iter().collect();
        atlas.map.get_keyframe_mut(kf).unwrap().set_bow(bow, Default::default());
        atlas.register_keyframe(kf);
        assert!(atlas.keyframe_db.contains(kf));

        atlas.remove_keyframe_full(kf);
        assert!(!atlas.keyframe_db.contains(kf));
        assert_eq!(atlas.map.num_keyframes(), 0);
    }
}
