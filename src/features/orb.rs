//! ORB extractor: FAST-9 corners on a scale pyramid, intensity-centroid
//! orientation and rotated BRIEF descriptors.

use image::imageops::{self, FilterType};
use image::GrayImage;

use super::descriptor::Descriptor;
use super::{FeatureSet, KeyPoint};

/// Radius of the orientation patch.
const HALF_PATCH_SIZE: i32 = 15;
/// Keypoints closer than this to the level border are discarded.
const EDGE_THRESHOLD: i32 = 19;
/// FAST circle radius.
const FAST_RADIUS: i32 = 3;
/// Detection cell size in level pixels.
const DETECTION_CELL: i32 = 30;
/// Sigma of the smoothing applied before descriptor sampling.
const DESCRIPTOR_BLUR_SIGMA: f32 = 2.0;

const NUM_BRIEF_TESTS: usize = 256;

/// BRIEF test pairs `(x1, y1, x2, y2)` inside a ±13 pixel window, generated
/// with a fixed-seed LCG.
const BRIEF_PATTERN: [(i8, i8, i8, i8); NUM_BRIEF_TESTS] = generate_brief_pattern();

const fn generate_brief_pattern() -> [(i8, i8, i8, i8); NUM_BRIEF_TESTS] {
    let mut pairs = [(0i8, 0i8, 0i8, 0i8); NUM_BRIEF_TESTS];
    let mut state: u32 = 0x0b5e_55ed;
    let mut i = 0;
    while i < NUM_BRIEF_TESTS {
        let mut coords = [0i8; 4];
        let mut k = 0;
        while k < 4 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            coords[k] = ((state >> 16) % 27) as i8 - 13;
            k += 1;
        }
        pairs[i] = (coords[0], coords[1], coords[2], coords[3]);
        i += 1;
    }
    pairs
}

/// FAST Bresenham circle of radius 3, clockwise from 12 o'clock.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

/// Extractor parameters.
#[derive(Debug, Clone)]
pub struct OrbParams {
    pub n_features: usize,
    pub scale_factor: f64,
    pub n_levels: usize,
    pub ini_th_fast: u8,
    pub min_th_fast: u8,
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        }
    }
}

/// Per-level scale factors and measurement variances of the pyramid.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub n_levels: usize,
    pub scale_factors: Vec<f64>,
    pub inv_scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
    log_scale_factor: f64,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, n_levels: usize) -> Self {
        let n_levels = n_levels.max(1);
        let scale_factors: Vec<f64> = (0..n_levels).map(|i| scale_factor.powi(i as i32)).collect();
        let inv_scale_factors = scale_factors.iter().map(|s| 1.0 / s).collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        let inv_level_sigma2 = level_sigma2.iter().map(|s| 1.0 / s).collect();
        Self {
            scale_factor,
            n_levels,
            scale_factors,
            inv_scale_factors,
            level_sigma2,
            inv_level_sigma2,
            log_scale_factor: scale_factor.ln(),
        }
    }

    #[inline]
    pub fn scale(&self, octave: u8) -> f64 {
        self.scale_factors[(octave as usize).min(self.n_levels - 1)]
    }

    #[inline]
    pub fn sigma2(&self, octave: u8) -> f64 {
        self.level_sigma2[(octave as usize).min(self.n_levels - 1)]
    }

    #[inline]
    pub fn inv_sigma2(&self, octave: u8) -> f64 {
        self.inv_level_sigma2[(octave as usize).min(self.n_levels - 1)]
    }

    /// Pyramid level at which a point at `dist` is expected to be detected,
    /// given the maximum distance of its scale-invariance range.
    pub fn predict_scale(&self, dist: f64, max_distance: f64) -> u8 {
        if dist <= 0.0 {
            return 0;
        }
        let ratio = max_distance / dist;
        let level = (ratio.ln() / self.log_scale_factor).ceil();
        level.clamp(0.0, (self.n_levels - 1) as f64) as u8
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}

/// ORB feature extractor.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    params: OrbParams,
    pyramid: ScalePyramid,
    features_per_level: Vec<usize>,
    umax: Vec<i32>,
}

impl OrbExtractor {
    pub fn new(params: OrbParams) -> Self {
        let pyramid = ScalePyramid::new(params.scale_factor, params.n_levels);
        let features_per_level = distribute_features(params.n_features, &pyramid);
        let umax = (0..=HALF_PATCH_SIZE)
            .map(|v| (((HALF_PATCH_SIZE * HALF_PATCH_SIZE - v * v) as f64).sqrt()).round() as i32)
            .collect();
        Self {
            params,
            pyramid,
            features_per_level,
            umax,
        }
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    pub fn params(&self) -> &OrbParams {
        &self.params
    }

    /// Detect keypoints and compute descriptors.
    pub fn extract(&self, image: &GrayImage) -> FeatureSet {
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let (w0, h0) = image.dimensions();

        for level in 0..self.pyramid.n_levels {
            let inv_scale = self.pyramid.inv_scale_factors[level];
            let w = (w0 as f64 * inv_scale).round() as u32;
            let h = (h0 as f64 * inv_scale).round() as u32;
            if (w as i32) <= 2 * EDGE_THRESHOLD || (h as i32) <= 2 * EDGE_THRESHOLD {
                break;
            }
            let level_img = if level == 0 {
                image.clone()
            } else {
                imageops::resize(image, w, h, FilterType::Triangle)
            };

            let corners = self.detect_level(&level_img, self.features_per_level[level]);
            if corners.is_empty() {
                continue;
            }
            let blurred = imageops::blur(&level_img, DESCRIPTOR_BLUR_SIGMA);
            let scale = self.pyramid.scale_factors[level];

            for (x, y, response) in corners {
                let angle = self.ic_angle(&level_img, x, y);
                descriptors.push(compute_descriptor(&blurred, x, y, angle));
                keypoints.push(KeyPoint {
                    x: x as f64 * scale,
                    y: y as f64 * scale,
                    angle,
                    response,
                    octave: level as u8,
                });
            }
        }

        FeatureSet::new(keypoints, descriptors)
    }

    /// FAST detection on one level, bucketed into cells and thinned to `budget`.
    fn detect_level(&self, img: &GrayImage, budget: usize) -> Vec<(i32, i32, f32)> {
        let (w, h) = (img.width() as i32, img.height() as i32);
        let min_b = EDGE_THRESHOLD - FAST_RADIUS;
        let (max_x, max_y) = (w - min_b, h - min_b);
        if budget == 0 || max_x <= min_b || max_y <= min_b {
            return Vec::new();
        }

        let n_cols = ((max_x - min_b) / DETECTION_CELL).max(1);
        let n_rows = ((max_y - min_b) / DETECTION_CELL).max(1);
        let cell_w = ((max_x - min_b) as f64 / n_cols as f64).ceil() as i32;
        let cell_h = ((max_y - min_b) as f64 / n_rows as f64).ceil() as i32;

        let mut scores = vec![0f32; (w * h) as usize];
        let mut raw = Vec::new();
        for row in 0..n_rows {
            let y0 = min_b + row * cell_h;
            let y1 = (y0 + cell_h).min(max_y);
            for col in 0..n_cols {
                let x0 = min_b + col * cell_w;
                let x1 = (x0 + cell_w).min(max_x);
                let before = raw.len();
                fast_in_rect(img, x0, y0, x1, y1, self.params.ini_th_fast, &mut raw);
                if raw.len() == before {
                    fast_in_rect(img, x0, y0, x1, y1, self.params.min_th_fast, &mut raw);
                }
            }
        }
        for &(x, y, s) in &raw {
            scores[(y * w + x) as usize] = s;
        }

        // 3x3 non-maximum suppression, keep only points clear of the edge.
        let kept: Vec<(i32, i32, f32)> = raw
            .into_iter()
            .filter(|&(x, y, s)| {
                if x < EDGE_THRESHOLD || y < EDGE_THRESHOLD || x >= w - EDGE_THRESHOLD || y >= h - EDGE_THRESHOLD {
                    return false;
                }
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let other = scores[((y + dy) * w + (x + dx)) as usize];
                        // Ties are broken toward the earlier pixel in raster order.
                        if other > s || (other == s && (dy < 0 || (dy == 0 && dx < 0))) {
                            return false;
                        }
                    }
                }
                true
            })
            .collect();

        select_by_grid(kept, w, h, budget)
    }

    /// Orientation by intensity centroid over a circular patch.
    fn ic_angle(&self, img: &GrayImage, x: i32, y: i32) -> f32 {
        let (w, h) = (img.width() as i32, img.height() as i32);
        let mut m01 = 0i64;
        let mut m10 = 0i64;
        for v in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
            let d = self.umax[v.unsigned_abs() as usize];
            for u in -d..=d {
                let val = pixel(img, w, h, x + u, y + v) as i64;
                m10 += u as i64 * val;
                m01 += v as i64 * val;
            }
        }
        (m01 as f32).atan2(m10 as f32)
    }
}

/// Split the feature budget geometrically across levels by area.
fn distribute_features(n_features: usize, pyramid: &ScalePyramid) -> Vec<usize> {
    let n = pyramid.n_levels;
    let factor = 1.0 / pyramid.scale_factor;
    let denom = 1.0 - factor.powi(n as i32);
    let mut per_level = Vec::with_capacity(n);
    let mut assigned = 0usize;
    let mut desired = if denom.abs() > 1e-12 {
        n_features as f64 * (1.0 - factor) / denom
    } else {
        n_features as f64 / n as f64
    };
    for _ in 0..n.saturating_sub(1) {
        let count = (desired.round() as usize).min(n_features - assigned);
        per_level.push(count);
        assigned += count;
        desired *= factor;
    }
    per_level.push(n_features.saturating_sub(assigned));
    per_level
}

#[inline]
fn pixel(img: &GrayImage, w: i32, h: i32, x: i32, y: i32) -> u8 {
    let xc = x.clamp(0, w - 1) as u32;
    let yc = y.clamp(0, h - 1) as u32;
    img.get_pixel(xc, yc)[0]
}

/// FAST-9 segment test over `[x0, x1) × [y0, y1)`, appending `(x, y, score)`.
fn fast_in_rect(img: &GrayImage, x0: i32, y0: i32, x1: i32, y1: i32, threshold: u8, out: &mut Vec<(i32, i32, f32)>) {
    let t = threshold as i32;
    let (w, h) = (img.width() as i32, img.height() as i32);
    for y in y0.max(FAST_RADIUS)..y1.min(h - FAST_RADIUS) {
        for x in x0.max(FAST_RADIUS)..x1.min(w - FAST_RADIUS) {
            let c = img.get_pixel(x as u32, y as u32)[0] as i32;
            let mut ring = [0i32; 16];
            for (k, (dx, dy)) in CIRCLE.iter().enumerate() {
                ring[k] = img.get_pixel((x + dx) as u32, (y + dy) as u32)[0] as i32 - c;
            }
            if let Some(score) = fast_score(&ring, t) {
                out.push((x, y, score));
            }
        }
    }
}

/// Score of a FAST corner (sum of absolute differences beyond the
/// threshold), or `None` if there is no contiguous arc of 9.
fn fast_score(ring: &[i32; 16], t: i32) -> Option<f32> {
    // An arc of 9 always covers at least two of the four compass points.
    let compass = [ring[0], ring[4], ring[8], ring[12]];
    let bright_c = compass.iter().filter(|&&d| d > t).count();
    let dark_c = compass.iter().filter(|&&d| d < -t).count();
    if bright_c < 2 && dark_c < 2 {
        return None;
    }

    let has_arc = |pred: &dyn Fn(i32) -> bool| {
        let mut run = 0;
        for k in 0..32 {
            if pred(ring[k % 16]) {
                run += 1;
                if run >= 9 {
                    return true;
                }
            } else {
                run = 0;
            }
        }
        false
    };
    let bright = has_arc(&|d| d > t);
    let dark = !bright && has_arc(&|d| d < -t);
    if !bright && !dark {
        return None;
    }
    let score: i32 = ring
        .iter()
        .filter(|&&d| if bright { d > t } else { d < -t })
        .map(|&d| d.abs() - t)
        .sum();
    Some(score as f32)
}

/// Keep at most `budget` corners, spreading them over a coarse grid and
/// favouring strong responses within each cell.
fn select_by_grid(mut corners: Vec<(i32, i32, f32)>, w: i32, h: i32, budget: usize) -> Vec<(i32, i32, f32)> {
    if corners.len() <= budget {
        return corners;
    }
    let cell = (DETECTION_CELL * 2).max(1);
    let cols = ((w + cell - 1) / cell).max(1) as usize;
    let rows = ((h + cell - 1) / cell).max(1) as usize;
    corners.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut cells: Vec<Vec<(i32, i32, f32)>> = vec![Vec::new(); cols * rows];
    for c in corners {
        let cx = ((c.0 / cell) as usize).min(cols - 1);
        let cy = ((c.1 / cell) as usize).min(rows - 1);
        cells[cy * cols + cx].push(c);
    }

    // Round robin over cells: best of each cell first, then second best, ...
    let mut selected = Vec::with_capacity(budget);
    let mut rank = 0;
    while selected.len() < budget {
        let mut round: Vec<(i32, i32, f32)> = cells.iter().filter_map(|c| c.get(rank).copied()).collect();
        if round.is_empty() {
            break;
        }
        round.sort_by(|a, b| b.2.total_cmp(&a.2));
        let take = (budget - selected.len()).min(round.len());
        selected.extend_from_slice(&round[..take]);
        rank += 1;
    }
    selected
}

/// Rotated BRIEF descriptor sampled on the smoothed level image.
fn compute_descriptor(blurred: &GrayImage, x: i32, y: i32, angle: f32) -> Descriptor {
    let (w, h) = (blurred.width() as i32, blurred.height() as i32);
    let (sin_a, cos_a) = angle.sin_cos();
    let rot = |px: i8, py: i8| -> (i32, i32) {
        let (px, py) = (px as f32, py as f32);
        (
            (px * cos_a - py * sin_a).round() as i32,
            (px * sin_a + py * cos_a).round() as i32,
        )
    };
    let mut desc = Descriptor::default();
    for (i, &(x1, y1, x2, y2)) in BRIEF_PATTERN.iter().enumerate() {
        let (ax, ay) = rot(x1, y1);
        let (bx, by) = rot(x2, y2);
        if pixel(blurred, w, h, x + ax, y + ay) < pixel(blurred, w, h, x + bx, y + by) {
            desc.set_bit(i);
        }
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn squares_image() -> GrayImage {
        let mut img = GrayImage::from_pixel(240, 200, Luma([30]));
        for &(x0, y0, s, v) in &[(60u32, 60u32, 40u32, 220u8), (140, 50, 30, 180), (100, 120, 50, 250)] {
            for y in y0..y0 + s {
                for x in x0..x0 + s {
                    img.put_pixel(x, y, Luma([v]));
                }
            }
        }
        img
    }

    #[test]
    fn test_uniform_image_has_no_features() {
        let img = GrayImage::from_pixel(128, 128, Luma([90]));
        let extractor = OrbExtractor::new(OrbParams::default());
        assert!(extractor.extract(&img).is_empty());
    }

    #[test]
    fn test_detects_square_corners() {
        let img = squares_image();
        let extractor = OrbExtractor::new(OrbParams {
            n_features: 200,
            ..OrbParams::default()
        });
        let features = extractor.extract(&img);
        assert!(!features.is_empty());
        assert!(features.len() <= 200);
        assert_eq!(features.keypoints.len(), features.descriptors.len());
        for kp in &features.keypoints {
            assert!(kp.x >= 0.0 && kp.x < 240.0 && kp.y >= 0.0 && kp.y < 200.0);
            assert!((kp.octave as usize) < 8);
        }
        let near_corner = features
            .keypoints
            .iter()
            .any(|kp| kp.octave == 0 && (kp.x - 60.0).abs() <= 3.0 && (kp.y - 60.0).abs() <= 3.0);
        assert!(near_corner, "no keypoint at the top-left corner of the first square");
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let img = squares_image();
        let extractor = OrbExtractor::new(OrbParams::default());
        let a = extractor.extract(&img);
        let b = extractor.extract(&img);
        assert_eq!(a.keypoints, b.keypoints);
        assert_eq!(a.descriptors, b.descriptors);
    }

    #[test]
    fn test_fast_score_requires_arc() {
        let mut ring = [0i32; 16];
        for d in ring.iter_mut().take(9) {
            *d = 50;
        }
        assert!(fast_score(&ring, 20).is_some());
        let mut short = [0i32; 16];
        for d in short.iter_mut().take(8) {
            *d = 50;
        }
        assert!(fast_score(&short, 20).is_none());
    }

    #[test]
    fn test_features_per_level_sum() {
        let pyramid = ScalePyramid::new(1.2, 8);
        let per_level = distribute_features(1000, &pyramid);
        assert_eq!(per_level.len(), 8);
        assert_eq!(per_level.iter().sum::<usize>(), 1000);
        assert!(per_level[0] > per_level[7]);
    }

    #[test]
    fn test_predict_scale() {
        let pyramid = ScalePyramid::new(1.2, 8);
        assert_eq!(pyramid.predict_scale(10.0, 10.0), 0);
        assert_eq!(pyramid.predict_scale(10.0 / 1.2f64.powi(3) + 1e-9, 10.0), 3);
        assert_eq!(pyramid.predict_scale(1e-3, 10.0), 7);
    }
}
