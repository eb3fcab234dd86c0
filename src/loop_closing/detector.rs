//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! This module implements the first stage of loop closing: finding older
//! keyframes that look like the current one but are not connected to it in
//! the covisibility graph, and keeping only those detected again and again
//! over consecutive keyframes.

use std::collections::HashSet;

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map};
use crate::atlas::Atlas;
use crate::config::LoopClosingSettings;
use crate::vocabulary::OrbVocabulary;

/// Configuration for loop detection.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// No detection while the map holds this many keyframes or fewer.
    pub min_keyframes_for_loop: usize,

    /// Keyframe ids that must separate a candidate from the current keyframe,
    /// and a new detection from the last closed loop.
    pub min_temporal_gap: u64,

    /// Consecutive consistent detections required before a candidate is
    /// verified.
    pub consistency_threshold: usize,
}

impl LoopDetectorConfig {
    pub fn from_settings(settings: &LoopClosingSettings) -> Self {
        Self {
            min_keyframes_for_loop: settings.min_keyframes_for_loop,
            min_temporal_gap: settings.min_temporal_gap,
            consistency_threshold: settings.consistency_threshold,
        }
    }
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self::from_settings(&LoopClosingSettings::default())
    }
}

/// A group of connected keyframes and how many consecutive keyframes have
/// produced a candidate inside it.
#[derive(Debug, Clone)]
struct ConsistentGroup {
    keyframes: HashSet<KeyFrameId>,
    consistency: usize,
}

/// Tracks loop candidates across keyframes.
pub struct LoopDetector {
    config: LoopDetectorConfig,
    consistent_groups: Vec<ConsistentGroup>,
    last_loop_kf_id: Option<KeyFrameId>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            config,
            consistent_groups: Vec::new(),
            last_loop_kf_id: None,
        }
    }

    /// Record a closed loop; detection restarts `min_temporal_gap` keyframes later.
    pub fn loop_closed(&mut self, kf_id: KeyFrameId) {
        self.last_loop_kf_id = Some(kf_id);
        self.consistent_groups.clear();
    }

    /// Candidates for `kf_id` that have been consistently detected.
    ///
    /// The minimum BoW score is the lowest score of the keyframe against its
    /// covisible keyframes, so candidates must look at least as similar as
    /// the keyframe's own neighbours.
    pub fn detect(&mut self, atlas: &Atlas, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
        let map = &atlas.map;
        if map.num_keyframes() <= self.config.min_keyframes_for_loop {
            return Vec::new();
        }
        if let Some(last) = self.last_loop_kf_id {
            if kf_id.0 < last.0 + self.config.min_temporal_gap {
                return Vec::new();
            }
        }

        let Some(min_score) = min_covisible_score(map, kf_id) else {
            return Vec::new();
        };

        let candidates: Vec<KeyFrameId> = atlas
            .keyframe_db
            .detect_loop_candidates(map, kf_id, min_score)
            .into_iter()
            .map(|c| c.keyframe_id)
            .filter(|c| c.0 + self.config.min_temporal_gap <= kf_id.0)
            .collect();
        if candidates.is_empty() {
            self.consistent_groups.clear();
            return Vec::new();
        }
        debug!(
            "[LoopClosing] kf={}: {} candidates above score {:.4}",
            kf_id,
            candidates.len(),
            min_score
        );

        let groups: Vec<(KeyFrameId, HashSet<KeyFrameId>)> = candidates
            .into_iter()
            .filter_map(|c| {
                let kf = map.get_keyframe(c)?;
                let mut group: HashSet<KeyFrameId> = kf.get_covisibles().copied().collect();
                group.insert(c);
                Some((c, group))
            })
            .collect();
        self.update_consistency(groups)
    }

    /// Carry the consistency counts over to the groups of the current
    /// candidates and return the candidates whose group has been seen by
    /// `consistency_threshold` previous keyframes.
    fn update_consistency(&mut self, groups: Vec<(KeyFrameId, HashSet<KeyFrameId>)>) -> Vec<KeyFrameId> {
        let mut enough = Vec::new();
        let mut current: Vec<ConsistentGroup> = Vec::new();
        let mut previous_used = vec![false; self.consistent_groups.len()];

        for (candidate, group) in groups {
            let mut consistent_for_some = false;
            let mut candidate_added = false;
            for (i, previous) in self.consistent_groups.iter().enumerate() {
                if group.is_disjoint(&previous.keyframes) {
                    continue;
                }
                consistent_for_some = true;
                let consistency = previous.consistency + 1;
                if !previous_used[i] {
                    current.push(ConsistentGroup {
                        keyframes: group.clone(),
                        consistency,
                    });
                    previous_used[i] = true;
                }
                if consistency >= self.config.consistency_threshold && !candidate_added {
                    enough.push(candidate);
                    candidate_added = true;
                }
            }
            if !consistent_for_some {
                current.push(ConsistentGroup {
                    keyframes: group,
                    consistency: 0,
                });
            }
        }

        self.consistent_groups = current;
        enough
    }
}

/// Lowest BoW score of `kf_id` against its covisible keyframes.
fn min_covisible_score(map: &Map, kf_id: KeyFrameId) -> Option<f64> {
    let kf = map.get_keyframe(kf_id)?;
    let bow = kf.bow_vector()?;
    kf.get_covisibles()
        .filter_map(|id| map.get_keyframe(*id))
        .filter(|other| !other.is_bad)
        .filter_map(|other| other.bow_vector())
        .map(|other| OrbVocabulary::score(bow, other))
        .min_by(|a, b| a.total_cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(ids: &[u64]) -> HashSet<KeyFrameId> {
        ids.iter().map(|&i| KeyFrameId(i)).collect()
    }

    fn detector(threshold: usize) -> LoopDetector {
        LoopDetector::new(LoopDetectorConfig {
            consistency_threshold: threshold,
            ..Default::default()
        })
    }

    #[test]
    fn test_consistent_candidates_accepted_after_threshold() {
        let mut detector = detector(3);

        for (i, ids) in [[1, 2], [2, 3], [3, 4]].iter().enumerate() {
            let result = detector.update_consistency(vec![(KeyFrameId(ids[0]), group(ids))]);
            assert!(result.is_empty(), "detection {} accepted too early", i);
        }
        let result = detector.update_consistency(vec![(KeyFrameId(4), group(&[4, 5]))]);
        assert_eq!(result, vec![KeyFrameId(4)]);
    }

    #[test]
    fn test_disjoint_candidates_restart_consistency() {
        let mut detector = detector(2);

        for i in 0..6u64 {
            let base = i * 10;
            let result = detector.update_consistency(vec![(KeyFrameId(base), group(&[base, base + 1]))]);
            assert!(result.is_empty());
        }
    }

    #[test]
    fn test_previous_group_extends_only_one_current_group() {
        let mut detector = detector(1);
        detector.update_consistency(vec![(KeyFrameId(1), group(&[1, 2, 3]))]);

        let result = detector.update_consistency(vec![
            (KeyFrameId(2), group(&[2])),
            (KeyFrameId(3), group(&[3])),
        ]);

        // Both candidates are consistent, but the previous group is carried
        // over once.
        assert_eq!(result, vec![KeyFrameId(2), KeyFrameId(3)]);
        assert_eq!(detector.consistent_groups.len(), 1);
    }

    #[test]
    fn test_small_map_is_not_searched() {
        let mut detector = detector(0);
        let atlas = Atlas::default();
        assert!(detector.detect(&atlas, KeyFrameId(0)).is_empty());
    }

    #[test]
    fn test_loop_closed_resets_groups() {
        let mut detector = detector(3);
        detector.update_consistency(vec![(KeyFrameId(1), group(&[1, 2]))]);
        detector.loop_closed(KeyFrameId(20));
        assert!(detector.consistent_groups.is_empty());
        assert_eq!(detector.last_loop_kf_id, Some(KeyFrameId(20)));
    }
}
