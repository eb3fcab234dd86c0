//! ORB Vocabulary for Bag-of-Words place recognition.
//!
//! A hierarchical k-majority tree over binary descriptors in the DBoW2 text
//! layout. Vocabularies are loaded from disk, or trained from a descriptor
//! corpus and saved back in the same format.
//!
//! # Key Types
//!
//! - [`BowVector`]: word id → L1-normalized TF-IDF weight (place recognition)
//! - [`FeatureVector`]: node id → feature indices (accelerated matching)
//! - [`OrbVocabulary`]: the tree with quantization and scoring

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::features::{hamming, Descriptor, DESCRIPTOR_BYTES};

/// Bag-of-Words vector: word id → weight, L1-normalized.
pub type BowVector = BTreeMap<u32, f64>;

/// Feature vector: node id → indices of the features quantized below it.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

const NO_PARENT: u32 = u32::MAX;
/// k-majority refinement rounds per node.
const MAX_CLUSTER_ITERATIONS: usize = 10;

/// A node in the vocabulary tree.
#[derive(Debug, Clone)]
pub struct VocabNode {
    pub id: u32,
    /// Parent node id (`u32::MAX` for the root).
    pub parent: u32,
    pub children: Vec<u32>,
    pub descriptor: Descriptor,
    /// IDF weight (leaves only).
    pub weight: f64,
    pub word_id: Option<u32>,
}

impl VocabNode {
    fn new(id: u32, parent: u32) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            descriptor: Descriptor::default(),
            weight: 0.0,
            word_id: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// ORB vocabulary tree.
#[derive(Debug, Clone)]
pub struct OrbVocabulary {
    /// `nodes[0]` is the root.
    nodes: Vec<VocabNode>,
    /// Word id → node id.
    words: Vec<u32>,
    /// Branching factor.
    k: usize,
    /// Depth levels.
    l: usize,
}

impl OrbVocabulary {
    /// Load a vocabulary from DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] ... desc[31] weight
    /// ...
    /// ```
    ///
    /// One line per node excluding the root, parents listed before children.
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| VocabularyError::Io(format!("{}: {}", path.display(), e)))?;
        let vocab = Self::read_text(BufReader::new(file))?;
        info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            vocab.k,
            vocab.l,
            vocab.nodes.len(),
            vocab.words.len()
        );
        Ok(vocab)
    }

    /// Parse the text format from any reader.
    pub fn read_text<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or(VocabularyError::Empty)?
            .map_err(|e| VocabularyError::Io(e.to_string()))?;

        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(VocabularyError::parse(1, "expected header `k L [scoring weighting]`"));
        }
        let k: usize = header_parts[0]
            .parse()
            .map_err(|_| VocabularyError::parse(1, "invalid k"))?;
        let l: usize = header_parts[1]
            .parse()
            .map_err(|_| VocabularyError::parse(1, "invalid L"))?;
        if k < 2 || l < 1 {
            return Err(VocabularyError::parse(1, "k must be at least 2 and L at least 1"));
        }

        let mut nodes = vec![VocabNode::new(0, NO_PARENT)];
        let mut words = Vec::new();

        for (idx, line_result) in lines.enumerate() {
            let line_no = idx + 2;
            let line = line_result.map_err(|e| VocabularyError::Io(e.to_string()))?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            if parts.len() < 3 + DESCRIPTOR_BYTES {
                return Err(VocabularyError::parse(line_no, format!("expected 35 fields, got {}", parts.len())));
            }

            let parent_id: u32 = parts[0]
                .parse()
                .map_err(|_| VocabularyError::parse(line_no, "invalid parent id"))?;
            if parent_id as usize >= nodes.len() {
                return Err(VocabularyError::parse(line_no, format!("parent {parent_id} not defined yet")));
            }
            let is_leaf = parts[1] == "1";

            let mut bytes = [0u8; DESCRIPTOR_BYTES];
            for (i, s) in parts[2..2 + DESCRIPTOR_BYTES].iter().enumerate() {
                bytes[i] = s
                    .parse()
                    .map_err(|_| VocabularyError::parse(line_no, "invalid descriptor byte"))?;
            }
            let weight: f64 = parts[2 + DESCRIPTOR_BYTES]
                .parse()
                .map_err(|_| VocabularyError::parse(line_no, "invalid weight"))?;

            let node_id = nodes.len() as u32;
            let mut node = VocabNode::new(node_id, parent_id);
            node.descriptor = Descriptor(bytes);
            node.weight = weight;
            if is_leaf {
                node.word_id = Some(words.len() as u32);
                words.push(node_id);
            }
            nodes[parent_id as usize].children.push(node_id);
            nodes.push(node);
        }

        if words.is_empty() {
            return Err(VocabularyError::Empty);
        }
        Ok(Self { nodes, words, k, l })
    }

    /// Write the vocabulary in DBoW2 text format.
    pub fn save_text<P: AsRef<Path>>(&self, path: P) -> Result<(), VocabularyError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| VocabularyError::Io(format!("{}: {}", path.display(), e)))?;
        let mut w = BufWriter::new(file);
        let io = |e: std::io::Error| VocabularyError::Io(e.to_string());
        // Scoring L1 (0), weighting TF-IDF (0).
        writeln!(w, "{} {} 0 0", self.k, self.l).map_err(io)?;
        for node in self.nodes.iter().skip(1) {
            write!(w, "{} {}", node.parent, if node.is_leaf() { 1 } else { 0 }).map_err(io)?;
            for b in node.descriptor.as_bytes() {
                write!(w, " {b}").map_err(io)?;
            }
            writeln!(w, " {}", node.weight).map_err(io)?;
        }
        w.flush().map_err(io)
    }

    /// Train a vocabulary with hierarchical k-majority clustering.
    ///
    /// Each training descriptor counts as one document for the IDF weights.
    pub fn train(descriptors: &[Descriptor], k: usize, l: usize, seed: u64) -> Result<Self, VocabularyError> {
        if descriptors.is_empty() {
            return Err(VocabularyError::Empty);
        }
        let k = k.max(2);
        let l = l.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut vocab = Self {
            nodes: vec![VocabNode::new(0, NO_PARENT)],
            words: Vec::new(),
            k,
            l,
        };

        // Iterative expansion: (node id, member indices, depth of its children).
        let mut stack: Vec<(u32, Vec<usize>, usize)> = vec![(0, (0..descriptors.len()).collect(), 1)];
        while let Some((parent, members, depth)) = stack.pop() {
            let clusters = k_majority(descriptors, &members, k, &mut rng);
            for (center, cluster) in clusters {
                let id = vocab.nodes.len() as u32;
                let mut node = VocabNode::new(id, parent);
                node.descriptor = center;
                vocab.nodes.push(node);
                vocab.nodes[parent as usize].children.push(id);
                if depth < l && cluster.len() > 1 {
                    stack.push((id, cluster, depth + 1));
                }
            }
        }

        // Enumerate leaves in id order so word ids are stable.
        for id in 0..vocab.nodes.len() {
            if id != 0 && vocab.nodes[id].is_leaf() {
                vocab.nodes[id].word_id = Some(vocab.words.len() as u32);
                vocab.words.push(id as u32);
            }
        }

        // IDF: ln(N / n_i) with each descriptor as a document.
        let mut counts = vec![0usize; vocab.words.len()];
        for d in descriptors {
            let (word, _) = vocab.quantize(d);
            counts[word as usize] += 1;
        }
        let n = descriptors.len() as f64;
        for (word, &count) in counts.iter().enumerate() {
            let node = vocab.words[word] as usize;
            vocab.nodes[node].weight = if count > 0 { (n / count as f64).ln() } else { 0.0 };
        }

        info!(
            "Trained vocabulary: k={}, L={}, {} nodes, {} words from {} descriptors",
            k,
            l,
            vocab.nodes.len(),
            vocab.words.len(),
            descriptors.len()
        );
        Ok(vocab)
    }

    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Levels up from the leaves used for feature-vector grouping.
    pub fn default_levels_up(&self) -> usize {
        4.min(self.l.saturating_sub(1))
    }

    /// Descend to the leaf closest to `desc`. Returns `(word_id, leaf_node_id)`.
    pub fn quantize(&self, desc: &Descriptor) -> (u32, u32) {
        let (word, leaf, _) = self.descend(desc, usize::MAX);
        (word, leaf)
    }

    /// Descend the tree, also reporting the node visited at depth `group_depth`
    /// (or the leaf if the branch is shallower).
    fn descend(&self, desc: &Descriptor, group_depth: usize) -> (u32, u32, u32) {
        let mut node_id = 0usize;
        let mut depth = 0usize;
        let mut group = 0u32;
        while !self.nodes[node_id].children.is_empty() {
            let mut best_child = self.nodes[node_id].children[0];
            let mut best_dist = hamming(desc, &self.nodes[best_child as usize].descriptor);
            for &child in &self.nodes[node_id].children[1..] {
                let dist = hamming(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
            depth += 1;
            if depth <= group_depth {
                group = node_id as u32;
            }
        }
        let word_id = self.nodes[node_id].word_id.unwrap_or(0);
        (word_id, node_id as u32, group)
    }

    /// Transform descriptors to a BowVector and a FeatureVector grouped at
    /// depth `L - levels_up`.
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();
        let group_depth = self.l.saturating_sub(levels_up);

        for (i, desc) in descriptors.iter().enumerate() {
            let (word_id, leaf_id, group) = self.descend(desc, group_depth);
            let weight = self.nodes[leaf_id as usize].weight;
            if weight > 0.0 {
                *bow.entry(word_id).or_insert(0.0) += weight;
            }
            feat.entry(group).or_default().push(i);
        }

        normalize_l1(&mut bow);
        (bow, feat)
    }

    /// Transform descriptors to a BowVector only.
    pub fn transform_bow_only(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for desc in descriptors {
            let (word_id, leaf_id) = self.quantize(desc);
            let weight = self.nodes[leaf_id as usize].weight;
            if weight > 0.0 {
                *bow.entry(word_id).or_insert(0.0) += weight;
            }
        }
        normalize_l1(&mut bow);
        bow
    }

    /// L1 similarity `1 - 0.5 * |v1 - v2|₁` in `[0, 1]`.
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        1.0 - 0.5 * diff_sum
    }
}

fn normalize_l1(bow: &mut BowVector) {
    let sum: f64 = bow.values().sum();
    if sum > 0.0 {
        for v in bow.values_mut() {
            *v /= sum;
        }
    }
}

/// Split `members` into at most `k` clusters. Returns `(center, members)` pairs.
fn k_majority(descriptors: &[Descriptor], members: &[usize], k: usize, rng: &mut StdRng) -> Vec<(Descriptor, Vec<usize>)> {
    if members.len() <= k {
        return members.iter().map(|&i| (descriptors[i], vec![i])).collect();
    }

    // k-means++ seeding.
    let mut centers: Vec<Descriptor> = vec![descriptors[members[rng.gen_range(0..members.len())]]];
    let mut min_dist: Vec<f64> = members
        .iter()
        .map(|&i| hamming(&descriptors[i], &centers[0]) as f64)
        .collect();
    while centers.len() < k {
        let total: f64 = min_dist.iter().map(|d| d * d).sum();
        if total <= 0.0 {
            break;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut pick = members.len() - 1;
        for (j, d) in min_dist.iter().enumerate() {
            target -= d * d;
            if target <= 0.0 {
                pick = j;
                break;
            }
        }
        let c = descriptors[members[pick]];
        for (j, &i) in members.iter().enumerate() {
            min_dist[j] = min_dist[j].min(hamming(&descriptors[i], &c) as f64);
        }
        centers.push(c);
    }

    let mut assignment = vec![usize::MAX; members.len()];
    for _ in 0..MAX_CLUSTER_ITERATIONS {
        let mut changed = false;
        for (j, &i) in members.iter().enumerate() {
            let best = centers
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| hamming(&descriptors[i], c))
                .map(|(c, _)| c)
                .unwrap_or(0);
            if assignment[j] != best {
                assignment[j] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        // Bitwise majority vote per cluster.
        for (c, center) in centers.iter_mut().enumerate() {
            let mut votes = [0usize; DESCRIPTOR_BYTES * 8];
            let mut count = 0usize;
            for (j, &i) in members.iter().enumerate() {
                if assignment[j] != c {
                    continue;
                }
                count += 1;
                for (bit, v) in votes.iter_mut().enumerate() {
                    if descriptors[i].bit(bit) {
                        *v += 1;
                    }
                }
            }
            if count == 0 {
                continue;
            }
            let mut d = Descriptor::default();
            for (bit, &v) in votes.iter().enumerate() {
                if v * 2 > count {
                    d.set_bit(bit);
                }
            }
            *center = d;
        }
    }

    let mut clusters: Vec<(Descriptor, Vec<usize>)> = centers.into_iter().map(|c| (c, Vec::new())).collect();
    for (j, &i) in members.iter().enumerate() {
        if let Some(cluster) = clusters.get_mut(assignment[j]) {
            cluster.1.push(i);
        }
    }
    clusters.retain(|(_, m)| !m.is_empty());
    clusters
}

/// Errors that can occur when loading or building a vocabulary.
#[derive(Debug)]
pub enum VocabularyError {
    /// I/O error reading or writing the file.
    Io(String),
    /// Malformed content.
    Parse { line: usize, msg: String },
    /// No words (empty file or empty training set).
    Empty,
}

impl VocabularyError {
    fn parse(line: usize, msg: impl Into<String>) -> Self {
        VocabularyError::Parse { line, msg: msg.into() }
    }
}

impl std::fmt::Display for VocabularyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VocabularyError::Io(msg) => write!(f, "vocabulary I/O error: {}", msg),
            VocabularyError::Parse { line, msg } => write!(f, "vocabulary parse error at line {}: {}", line, msg),
            VocabularyError::Empty => write!(f, "vocabulary has no words"),
        }
    }
}

impl std::error::Error for VocabularyError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_descriptors(seed: u64, n: usize) -> Vec<Descriptor> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut b = [0u8; 32];
                rng.fill(&mut b);
                Descriptor(b)
            })
            .collect()
    }

    #[test]
    fn test_bow_score() {
        let mut v1 = BowVector::new();
        v1.insert(0, 0.5);
        v1.insert(1, 0.5);
        let v2 = v1.clone();
        assert!((OrbVocabulary::score(&v1, &v2) - 1.0).abs() < 1e-10);

        let mut v3 = BowVector::new();
        v3.insert(2, 0.5);
        v3.insert(3, 0.5);
        assert!(OrbVocabulary::score(&v1, &v3) < 0.01);
    }

    #[test]
    fn test_vocab_node_creation() {
        let node = VocabNode::new(1, 0);
        assert_eq!(node.id, 1);
        assert_eq!(node.parent, 0);
        assert!(node.is_leaf());
        assert!(node.word_id.is_none());
    }

    #[test]
    fn test_train_quantizes_training_data_to_distinct_words() {
        let descs = random_descriptors(11, 300);
        let vocab = OrbVocabulary::train(&descs, 5, 3, 42).unwrap();
        assert!(vocab.num_words() > 25);
        assert!(vocab.num_words() <= 125);

        let (bow_a, fv_a) = vocab.transform(&descs[..100], vocab.default_levels_up());
        let (bow_b, _) = vocab.transform(&descs[..100], vocab.default_levels_up());
        assert!((OrbVocabulary::score(&bow_a, &bow_b) - 1.0).abs() < 1e-10);
        assert_eq!(fv_a.values().map(Vec::len).sum::<usize>(), 100);

        let bow_c = vocab.transform_bow_only(&descs[200..300]);
        assert!(OrbVocabulary::score(&bow_a, &bow_c) < 0.9);
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let descs = random_descriptors(5, 120);
        let vocab = OrbVocabulary::train(&descs, 4, 3, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voc.txt");
        vocab.save_text(&path).unwrap();

        let loaded = OrbVocabulary::load_from_text(&path).unwrap();
        assert_eq!(loaded.params(), vocab.params());
        assert_eq!(loaded.num_nodes(), vocab.num_nodes());
        assert_eq!(loaded.num_words(), vocab.num_words());
        for d in &descs[..20] {
            assert_eq!(loaded.quantize(d), vocab.quantize(d));
        }
    }

    #[test]
    fn test_malformed_file_reports_line() {
        let text = "10 6 0 0\n0 1 1 2 3\n";
        let err = OrbVocabulary::read_text(text.as_bytes()).unwrap_err();
        assert!(matches!(err, VocabularyError::Parse { line: 2, .. }));
        assert!(matches!(OrbVocabulary::read_text("".as_bytes()), Err(VocabularyError::Empty)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = OrbVocabulary::load_from_text("/nonexistent/voc.txt").unwrap_err();
        assert!(matches!(err, VocabularyError::Io(_)));
    }
}
