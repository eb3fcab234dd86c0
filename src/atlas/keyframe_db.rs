//! KeyFrameDatabase - place recognition over bag-of-words vectors.
//!
//! An inverted file maps every vocabulary word to the KeyFrames containing
//! it. Queries count common words, score the best-sharing KeyFrames with the
//! L1 BoW similarity and then accumulate scores over covisibility groups, so
//! a candidate is returned only when its neighbourhood agrees.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::atlas::map::{KeyFrameId, Map};
use crate::vocabulary::{BowVector, OrbVocabulary};

/// Fraction of the best common-word count a KeyFrame needs to be scored.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;
/// Fraction of the best accumulated score a candidate needs to be returned.
const MIN_ACCUMULATED_RATIO: f64 = 0.75;
/// Covisible KeyFrames considered when accumulating a candidate's score.
const ACCUMULATION_NEIGHBORS: usize = 10;

/// Candidate keyframe with its accumulated similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    inverted_file: HashMap<u32, Vec<KeyFrameId>>,
    /// Words of every registered KeyFrame, so it can be erased by id.
    words: HashMap<KeyFrameId, Vec<u32>>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.words.contains_key(&kf_id)
    }

    /// Add or re-add a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        self.erase(kf_id);
        let words: Vec<u32> = bow.keys().copied().collect();
        for &w in &words {
            self.inverted_file.entry(w).or_default().push(kf_id);
        }
        self.words.insert(kf_id, words);
    }

    /// Remove a keyframe from the database.
    pub fn erase(&mut self, kf_id: KeyFrameId) {
        let Some(words) = self.words.remove(&kf_id) else {
            return;
        };
        for w in words {
            if let Some(list) = self.inverted_file.get_mut(&w) {
                list.retain(|&id| id != kf_id);
                if list.is_empty() {
                    self.inverted_file.remove(&w);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted_file.clear();
        self.words.clear();
    }

    /// Number of words shared with `bow`, per registered KeyFrame not in `exclude`.
    fn common_words(&self, bow: &BowVector, exclude: &HashSet<KeyFrameId>) -> BTreeMap<KeyFrameId, usize> {
        let mut counts = BTreeMap::new();
        for word in bow.keys() {
            if let Some(kfs) = self.inverted_file.get(word) {
                for kf_id in kfs {
                    if !exclude.contains(kf_id) {
                        *counts.entry(*kf_id).or_insert(0usize) += 1;
                    }
                }
            }
        }
        counts
    }

    /// Shared query pipeline: common words, BoW scores, covisibility
    /// accumulation, relative threshold.
    fn query(&self, map: &Map, bow: &BowVector, exclude: &HashSet<KeyFrameId>, min_score: f64) -> Vec<Candidate> {
        let common = self.common_words(bow, exclude);
        let Some(&max_common) = common.values().max() else {
            return Vec::new();
        };
        let min_common = (MIN_COMMON_WORDS_RATIO * max_common as f64) as usize;

        let mut scores: BTreeMap<KeyFrameId, f64> = BTreeMap::new();
        for (&kf_id, &n) in &common {
            if n <= min_common && n != max_common {
                continue;
            }
            let Some(kf_bow) = map.get_keyframe(kf_id).and_then(|kf| kf.bow_vector()) else {
                continue;
            };
            let score = OrbVocabulary::score(bow, kf_bow);
            if score >= min_score {
                scores.insert(kf_id, score);
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        // Accumulate over each candidate's best covisibles; the group is
        // represented by its best-scoring member.
        let mut groups: Vec<(f64, KeyFrameId)> = Vec::new();
        for (&kf_id, &score) in &scores {
            let mut acc = score;
            let mut best = (score, kf_id);
            if let Some(kf) = map.get_keyframe(kf_id) {
                for neighbor in kf.get_best_covisibles(ACCUMULATION_NEIGHBORS) {
                    if let Some(&s) = scores.get(&neighbor) {
                        acc += s;
                        if s > best.0 {
                            best = (s, neighbor);
                        }
                    }
                }
            }
            groups.push((acc, best.1));
        }

        let best_acc = groups.iter().map(|(acc, _)| *acc).fold(0.0, f64::max);
        let min_acc = MIN_ACCUMULATED_RATIO * best_acc;

        let mut seen = HashSet::new();
        let mut out: Vec<Candidate> = Vec::new();
        groups.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        for (acc, kf_id) in groups {
            if acc >= min_acc && seen.insert(kf_id) {
                out.push(Candidate {
                    keyframe_id: kf_id,
                    score: acc,
                });
            }
        }
        out
    }

    /// Loop candidates for `kf_id`: KeyFrames not connected to it in the
    /// covisibility graph whose BoW score reaches `min_score`.
    pub fn detect_loop_candidates(&self, map: &Map, kf_id: KeyFrameId, min_score: f64) -> Vec<Candidate> {
        let Some(kf) = map.get_keyframe(kf_id) else {
            return Vec::new();
        };
        let Some(bow) = kf.bow_vector() else {
            return Vec::new();
        };
        let mut exclude: HashSet<KeyFrameId> = kf.get_covisibles().copied().collect();
        exclude.insert(kf_id);
        self.query(map, bow, &exclude, min_score)
    }

    /// Relocalization candidates for a frame's BoW vector.
    pub fn detect_relocalization_candidates(&self, map: &Map, bow: &BowVector) -> Vec<Candidate> {
        self.query(map, bow, &HashSet::new(), 0.0)
    }
}
