//! Spatial index over keypoints for radius queries.

use super::KeyPoint;

/// Uniform grid over the image; each cell lists the indices of the keypoints
/// that fall inside it.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Row-major: `cells[row * cols + col]`.
    cells: Vec<Vec<usize>>,
    cell_width_inv: f64,
    cell_height_inv: f64,
    cols: usize,
    rows: usize,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(keypoints: &[KeyPoint], img_width: f64, img_height: f64) -> Self {
        let cols = Self::GRID_COLS;
        let rows = Self::GRID_ROWS;
        let cell_width_inv = cols as f64 / img_width.max(1.0);
        let cell_height_inv = rows as f64 / img_height.max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); cols * rows];
        for (idx, kp) in keypoints.iter().enumerate() {
            // Points outside the image (after undistortion) are not indexed.
            if kp.x < 0.0 || kp.y < 0.0 {
                continue;
            }
            let cx = (kp.x * cell_width_inv) as usize;
            let cy = (kp.y * cell_height_inv) as usize;
            if cx >= cols || cy >= rows {
                continue;
            }
            cells[cy * cols + cx].push(idx);
        }

        Self {
            cells,
            cell_width_inv,
            cell_height_inv,
            cols,
            rows,
        }
    }

    /// Indices of keypoints within radius `r` of `(x, y)`, optionally
    /// restricted to an octave range (inclusive).
    pub fn features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        level_range: Option<(u8, u8)>,
    ) -> Vec<usize> {
        let min_cx = ((x - r) * self.cell_width_inv).floor().max(0.0) as usize;
        let max_cx = ((x + r) * self.cell_width_inv).ceil();
        let min_cy = ((y - r) * self.cell_height_inv).floor().max(0.0) as usize;
        let max_cy = ((y + r) * self.cell_height_inv).ceil();
        if max_cx < 0.0 || max_cy < 0.0 || min_cx >= self.cols || min_cy >= self.rows {
            return Vec::new();
        }
        let max_cx = (max_cx as usize).min(self.cols - 1);
        let max_cy = (max_cy as usize).min(self.rows - 1);

        let r2 = r * r;
        let mut out = Vec::new();
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                for &idx in &self.cells[cy * self.cols + cx] {
                    let kp = &keypoints[idx];
                    if let Some((lo, hi)) = level_range {
                        if kp.octave < lo || kp.octave > hi {
                            continue;
                        }
                    }
                    let dx = kp.x - x;
                    let dy = kp.y - y;
                    if dx * dx + dy * dy <= r2 {
                        out.push(idx);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_query() {
        let kps = vec![
            KeyPoint::new(10.0, 10.0),
            KeyPoint::new(15.0, 10.0),
            KeyPoint::new(100.0, 100.0),
            KeyPoint {
                octave: 3,
                ..KeyPoint::new(12.0, 12.0)
            },
        ];
        let grid = FeatureGrid::new(&kps, 640.0, 480.0);
        let mut found = grid.features_in_area(&kps, 11.0, 10.0, 5.0, None);
        found.sort_unstable();
        assert_eq!(found, vec![0, 1, 3]);
        assert_eq!(grid.features_in_area(&kps, 11.0, 10.0, 5.0, Some((0, 1))), vec![0, 1]);
        assert!(grid.features_in_area(&kps, 300.0, 300.0, 5.0, None).is_empty());
    }
}
