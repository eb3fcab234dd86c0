//! Trajectory accuracy against a reference trajectory.
//!
//! Rows are compared pairwise by index (see [`associate`] to pair them by
//! time stamp first). Errors are reported as WAPE, the sum of absolute
//! errors over the sum of absolute reference values, per component and
//! aggregated over position and orientation, plus per-frame differences.

use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;
use nalgebra::Vector3;
use serde::Serialize;

use crate::io::trajectory::TrajectoryRecord;
use crate::tracking::StampedPose;

/// Component names, in [`WapeReport::components`] order.
pub const COMPONENTS: [&str; 7] = ["x", "y", "z", "qx", "qy", "qz", "qw"];

/// `Σ|actual - estimate| / Σ|actual|`; `None` when the reference is all zero.
pub fn wape(actual: &[f64], estimate: &[f64]) -> Option<f64> {
    let numerator: f64 = actual.iter().zip(estimate).map(|(a, e)| (a - e).abs()).sum();
    let denominator: f64 = actual.iter().take(estimate.len()).map(|a| a.abs()).sum();
    (denominator > 0.0).then(|| numerator / denominator)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WapeReport {
    pub components: [Option<f64>; 7],
    pub position: Option<f64>,
    pub orientation: Option<f64>,
    pub num_pairs: usize,
}

impl WapeReport {
    /// One row per component, then the position and orientation aggregates.
    pub fn rows(&self) -> Vec<WapeRow> {
        let aggregates = [("aggregate position", self.position), ("aggregate orientation", self.orientation)];
        COMPONENTS
            .iter()
            .copied()
            .zip(self.components)
            .chain(aggregates)
            .map(|(name, wape)| WapeRow {
                component: name.to_string(),
                wape,
                wape_percent: wape.map(|w| w * 100.0),
            })
            .collect()
    }
}

/// A row of the WAPE table. Empty values mark an all-zero reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WapeRow {
    pub component: String,
    pub wape: Option<f64>,
    pub wape_percent: Option<f64>,
}

/// Per-frame difference between reference and estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMargin {
    pub timestamp: f64,
    pub diff_x: f64,
    pub diff_y: f64,
    pub diff_z: f64,
    pub position_margin: f64,
    pub diff_qx: f64,
    pub diff_qy: f64,
    pub diff_qz: f64,
    pub diff_qw: f64,
    pub orientation_margin: f64,
}

fn values(r: &TrajectoryRecord) -> [f64; 7] {
    [r.x, r.y, r.z, r.qx, r.qy, r.qz, r.qw]
}

/// `q` and `-q` are the same rotation; compare against the sign closest to the reference.
fn aligned_values(actual: &TrajectoryRecord, estimate: &TrajectoryRecord) -> [f64; 7] {
    let mut v = values(estimate);
    let dot = actual.qx * estimate.qx + actual.qy * estimate.qy + actual.qz * estimate.qz + actual.qw * estimate.qw;
    if dot < 0.0 {
        for q in &mut v[3..] {
            *q = -*q;
        }
    }
    v
}

pub fn evaluate_wape(actual: &[TrajectoryRecord], estimate: &[TrajectoryRecord]) -> WapeReport {
    let n = actual.len().min(estimate.len());
    let act: Vec<[f64; 7]> = actual[..n].iter().map(values).collect();
    let est: Vec<[f64; 7]> = actual[..n].iter().zip(&estimate[..n]).map(|(a, e)| aligned_values(a, e)).collect();

    let column = |c: usize, rows: &[[f64; 7]]| -> Vec<f64> { rows.iter().map(|r| r[c]).collect() };
    let flat = |range: std::ops::Range<usize>, rows: &[[f64; 7]]| -> Vec<f64> {
        rows.iter().flat_map(|r| r[range.clone()].to_vec()).collect()
    };

    let mut components = [None; 7];
    for (c, slot) in components.iter_mut().enumerate() {
        *slot = wape(&column(c, &act), &column(c, &est));
    }
    WapeReport {
        components,
        position: wape(&flat(0..3, &act), &flat(0..3, &est)),
        orientation: wape(&flat(3..7, &act), &flat(3..7, &est)),
        num_pairs: n,
    }
}

pub fn difference_margins(actual: &[TrajectoryRecord], estimate: &[TrajectoryRecord]) -> Vec<FrameMargin> {
    actual
        .iter()
        .zip(estimate)
        .map(|(a, e)| {
            let a_v = values(a);
            let e_v = aligned_values(a, e);
            let d: Vec<f64> = a_v.iter().zip(&e_v).map(|(x, y)| x - y).collect();
            FrameMargin {
                timestamp: a.timestamp,
                diff_x: d[0],
                diff_y: d[1],
                diff_z: d[2],
                position_margin: (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt(),
                diff_qx: d[3],
                diff_qy: d[4],
                diff_qz: d[5],
                diff_qw: d[6],
                orientation_margin: d[3..].iter().map(|x| x * x).sum::<f64>().sqrt(),
            }
        })
        .collect()
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_margins<P: AsRef<Path>>(path: P, margins: &[FrameMargin]) -> Result<()> {
    write_rows(path.as_ref(), margins)
}

pub fn write_wape<P: AsRef<Path>>(path: P, report: &WapeReport) -> Result<()> {
    write_rows(path.as_ref(), &report.rows())
}

/// Pair each estimated pose with the reference pose closest in time, within
/// `max_dt` seconds. Both inputs must be sorted by time stamp.
pub fn associate(
    actual: &[TrajectoryRecord],
    estimate: &[TrajectoryRecord],
    max_dt: f64,
) -> (Vec<TrajectoryRecord>, Vec<TrajectoryRecord>) {
    let mut pairs = (Vec::new(), Vec::new());
    let mut j = 0;
    for e in estimate {
        while j + 1 < actual.len() && (actual[j + 1].timestamp - e.timestamp).abs() <= (actual[j].timestamp - e.timestamp).abs() {
            j += 1;
        }
        if let Some(a) = actual.get(j) {
            if (a.timestamp - e.timestamp).abs() <= max_dt {
                pairs.0.push(a.clone());
                pairs.1.push(e.clone());
            }
        }
    }
    pairs
}

/// Length of the path through the camera centers.
pub fn path_length(poses: &[StampedPose]) -> f64 {
    poses
        .windows(2)
        .map(|w| (w[1].pose.camera_center() - w[0].pose.camera_center()).norm())
        .sum()
}

/// Monocular scale of `estimate` relative to `reference`: the ratio of their
/// path lengths. `None` if the estimate did not move.
pub fn path_length_scale(estimate: &[StampedPose], reference: &[StampedPose]) -> Option<f64> {
    let est = path_length(estimate);
    (est > 1e-12).then(|| path_length(reference) / est)
}

/// Scale the camera centers of `poses` about the first one and shift them
/// onto `origin`.
pub fn align_trajectory(poses: &[StampedPose], scale: f64, origin: Vector3<f64>) -> Vec<StampedPose> {
    let Some(first) = poses.first().map(|p| p.pose.camera_center()) else {
        return Vec::new();
    };
    poses
        .iter()
        .map(|p| {
            let mut twc = p.pose.inverse();
            twc.translation = origin + (twc.translation - first) * scale;
            StampedPose {
                frame_id: p.frame_id,
                timestamp: p.timestamp,
                pose: twc.inverse(),
            }
        })
        .collect()
}

pub fn to_records(poses: &[StampedPose]) -> Vec<TrajectoryRecord> {
    poses.iter().map(|p| TrajectoryRecord::from_pose_cw(p.timestamp, &p.pose)).collect()
}
