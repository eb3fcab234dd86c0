//! Descriptor matching: brute-force symmetric matching, vocabulary-guided
//! matching and the rotation-consistency histogram.

use std::collections::HashSet;

use super::descriptor::{hamming, Descriptor};
use crate::vocabulary::FeatureVector;

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold.
pub const TH_LOW: u32 = 50;
/// Bins of the rotation-consistency histogram.
pub const HISTO_LENGTH: usize = 30;

/// Thresholds for nearest-neighbour matching.
#[derive(Debug, Clone, Copy)]
pub struct MatchParams {
    pub max_distance: u32,
    /// Best distance must be below `ratio * second_best`.
    pub ratio: f32,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            max_distance: TH_HIGH,
            ratio: 0.8,
        }
    }
}

/// A correspondence between descriptor `query_idx` of the first set and
/// `train_idx` of the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Best and second-best distance search. Returns `(index, best, second)`.
fn nearest_two(query: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, u32, u32)> {
    let mut best = u32::MAX;
    let mut second = u32::MAX;
    let mut best_idx = None;
    for (j, d) in candidates.iter().enumerate() {
        let dist = hamming(query, d);
        if dist < best {
            second = best;
            best = dist;
            best_idx = Some(j);
        } else if dist < second {
            second = dist;
        }
    }
    best_idx.map(|j| (j, best, second))
}

fn passes(best: u32, second: u32, params: &MatchParams) -> bool {
    best <= params.max_distance && (second == u32::MAX || (best as f32) < params.ratio * second as f32)
}

/// Mutual nearest-neighbour matching with distance and ratio tests.
///
/// A pair `(i, j)` is returned only if `b[j]` is the accepted nearest
/// neighbour of `a[i]` and `a[i]` is the accepted nearest neighbour of `b[j]`.
/// Matching `b` against `a` therefore yields exactly the swapped pairs.
/// Either set empty gives an empty result.
pub fn match_symmetric(a: &[Descriptor], b: &[Descriptor], params: &MatchParams) -> Vec<FeatureMatch> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }

    // Accepted nearest neighbour of every b[j] in a.
    let backward: Vec<Option<usize>> = b
        .iter()
        .map(|d| {
            nearest_two(d, a).and_then(|(i, best, second)| passes(best, second, params).then_some(i))
        })
        .collect();

    let mut matches = Vec::new();
    for (i, d) in a.iter().enumerate() {
        let Some((j, best, second)) = nearest_two(d, b) else {
            continue;
        };
        if passes(best, second, params) && backward[j] == Some(i) {
            matches.push(FeatureMatch {
                query_idx: i,
                train_idx: j,
                distance: best,
            });
        }
    }
    matches
}

/// Histogram of keypoint orientation differences; matches outside the three
/// dominant bins are treated as inconsistent.
#[derive(Debug, Clone)]
pub struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl Default for RotationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationHistogram {
    pub fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    /// Record match `idx` whose keypoints have orientations `angle1`, `angle2` (radians).
    pub fn add(&mut self, angle1: f32, angle2: f32, idx: usize) {
        let mut rot = (angle1 - angle2).to_degrees();
        if rot < 0.0 {
            rot += 360.0;
        }
        let mut bin = (rot * HISTO_LENGTH as f32 / 360.0).round() as usize;
        if bin >= HISTO_LENGTH {
            bin = 0;
        }
        self.bins[bin].push(idx);
    }

    /// Indices recorded outside the (up to) three dominant bins.
    pub fn inconsistent(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by(|&a, &b| self.bins[b].len().cmp(&self.bins[a].len()).then(a.cmp(&b)));
        let max1 = self.bins[order[0]].len();
        let mut keep: HashSet<usize> = HashSet::from([order[0]]);
        let max2 = self.bins[order[1]].len();
        if (max2 as f32) >= 0.1 * max1 as f32 {
            keep.insert(order[1]);
            let max3 = self.bins[order[2]].len();
            if (max3 as f32) >= 0.1 * max1 as f32 {
                keep.insert(order[2]);
            }
        }
        (0..HISTO_LENGTH)
            .filter(|b| !keep.contains(b))
            .flat_map(|b| self.bins[b].iter().copied())
            .collect()
    }
}

/// Matching restricted to features assigned to the same vocabulary node.
///
/// `usable_a`/`usable_b` filter which features may take part (e.g. only
/// features with an associated map point). Each feature of `b` is used at most
/// once. When `angles` are given, a rotation-consistency check is applied.
#[allow(clippy::too_many_arguments)]
pub fn match_by_feature_vector(
    desc_a: &[Descriptor],
    fv_a: &FeatureVector,
    usable_a: impl Fn(usize) -> bool,
    desc_b: &[Descriptor],
    fv_b: &FeatureVector,
    usable_b: impl Fn(usize) -> bool,
    params: &MatchParams,
    angles: Option<(&[f32], &[f32])>,
) -> Vec<FeatureMatch> {
    let mut taken_b = vec![false; desc_b.len()];
    let mut matches: Vec<FeatureMatch> = Vec::new();

    for (node, idxs_a) in fv_a {
        let Some(idxs_b) = fv_b.get(node) else {
            continue;
        };
        for &ia in idxs_a {
            if !usable_a(ia) {
                continue;
            }
            let mut best = u32::MAX;
            let mut second = u32::MAX;
            let mut best_b = None;
            for &ib in idxs_b {
                if taken_b[ib] || !usable_b(ib) {
                    continue;
                }
                let dist = hamming(&desc_a[ia], &desc_b[ib]);
                if dist < best {
                    second = best;
                    best = dist;
                    best_b = Some(ib);
                } else if dist < second {
                    second = dist;
                }
            }
            if let Some(ib) = best_b {
                if passes(best, second, params) {
                    taken_b[ib] = true;
                    matches.push(FeatureMatch {
                        query_idx: ia,
                        train_idx: ib,
                        distance: best,
                    });
                }
            }
        }
    }

    if let Some((angles_a, angles_b)) = angles {
        let mut hist = RotationHistogram::new();
        for (k, m) in matches.iter().enumerate() {
            hist.add(angles_a[m.query_idx], angles_b[m.train_idx], k);
        }
        let drop: HashSet<usize> = hist.inconsistent().into_iter().collect();
        matches = matches
            .into_iter()
            .enumerate()
            .filter(|(k, _)| !drop.contains(k))
            .map(|(_, m)| m)
            .collect();
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_descriptors(rng: &mut StdRng, n: usize) -> Vec<Descriptor> {
        (0..n)
            .map(|_| {
                let mut bytes = [0u8; 32];
                rng.fill(&mut bytes);
                Descriptor(bytes)
            })
            .collect()
    }

    fn perturb(rng: &mut StdRng, d: &Descriptor, bits: usize) -> Descriptor {
        let mut out = *d;
        for _ in 0..bits {
            let i = rng.gen_range(0..256);
            out.0[i / 8] ^= 1 << (i % 8);
        }
        out
    }

    #[test]
    fn test_empty_inputs() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = random_descriptors(&mut rng, 5);
        assert!(match_symmetric(&a, &[], &MatchParams::default()).is_empty());
        assert!(match_symmetric(&[], &a, &MatchParams::default()).is_empty());
    }

    #[test]
    fn test_matches_perturbed_copies() {
        let mut rng = StdRng::seed_from_u64(2);
        let a = random_descriptors(&mut rng, 50);
        // b is a shuffled, slightly perturbed copy of a.
        let b: Vec<Descriptor> = a.iter().rev().map(|d| perturb(&mut rng, d, 10)).collect();
        let matches = match_symmetric(&a, &b, &MatchParams::default());
        assert_eq!(matches.len(), 50);
        for m in &matches {
            assert_eq!(m.train_idx, 49 - m.query_idx);
        }
    }

    #[test]
    fn test_matching_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random_descriptors(&mut rng, 80);
        let mut b: Vec<Descriptor> = a.iter().take(40).map(|d| perturb(&mut rng, d, 30)).collect();
        b.extend(random_descriptors(&mut rng, 60));
        let params = MatchParams {
            max_distance: TH_HIGH,
            ratio: 0.9,
        };
        let ab = match_symmetric(&a, &b, &params);
        let ba = match_symmetric(&b, &a, &params);
        let mut forward: Vec<(usize, usize)> = ab.iter().map(|m| (m.query_idx, m.train_idx)).collect();
        let mut backward: Vec<(usize, usize)> = ba.iter().map(|m| (m.train_idx, m.query_idx)).collect();
        forward.sort_unstable();
        backward.sort_unstable();
        assert!(!forward.is_empty());
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_rotation_histogram_rejects_outliers() {
        let mut hist = RotationHistogram::new();
        for i in 0..20 {
            hist.add(0.5, 0.0, i);
        }
        hist.add(2.5, 0.0, 100);
        let bad = hist.inconsistent();
        assert_eq!(bad, vec![100]);
    }
}
