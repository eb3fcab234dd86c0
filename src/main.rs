use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mono_vslam::evaluation::{
    align_trajectory, difference_margins, evaluate_wape, path_length_scale, to_records, write_margins, write_wape,
};
use mono_vslam::geometry::CameraModel;
use mono_vslam::io::write_trajectory;
use mono_vslam::synthetic::{straight_line, SyntheticScene};
use mono_vslam::SlamSystem;

const N_FRAMES: usize = 50;
const TRAVEL_M: f64 = 1.0;
const FPS: f64 = 30.0;
/// Frames used to fix the monocular scale against ground truth.
const SCALE_WINDOW: usize = 10;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let out_dir = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| ".".to_string()));
    std::fs::create_dir_all(&out_dir).with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let camera = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
    let scene = SyntheticScene::corridor(camera, 800, TRAVEL_M, 42);
    let ground_truth = straight_line(Vector3::zeros(), Vector3::new(TRAVEL_M, 0.0, 0.0), N_FRAMES, FPS);

    let mut settings = scene.settings();
    settings.camera.fps = FPS;
    let vocabulary = scene.train_vocabulary(6, 3, 0).context("Failed to train vocabulary")?;
    let mut slam = SlamSystem::with_vocabulary(Arc::new(vocabulary), settings)?;

    for gt in &ground_truth {
        let result = slam.track_features_detailed(scene.observe(&gt.pose), gt.timestamp);
        if result.metrics.keyframe_inserted && !slam.wait_until_mapping_idle(Duration::from_secs(5)) {
            warn!("Local Mapping is falling behind");
        }
    }
    slam.wait_until_mapping_idle(Duration::from_secs(10));

    let estimate = slam.trajectory();
    info!(
        "Tracked {}/{} frames, {} keyframes, {} map points",
        estimate.len(),
        N_FRAMES,
        slam.num_keyframes(),
        slam.num_map_points()
    );
    slam.shutdown();

    // Ground truth of the tracked frames only.
    let reference: Vec<_> = estimate
        .iter()
        .filter_map(|e| ground_truth.get(e.frame_id as usize).cloned())
        .collect();
    let window = SCALE_WINDOW.min(estimate.len());
    let scale = path_length_scale(&estimate[..window], &reference[..window]).context("Estimate did not move")?;
    let origin = reference.first().map(|p| p.pose.camera_center()).unwrap_or_else(Vector3::zeros);
    let aligned = align_trajectory(&estimate, scale, origin);

    write_trajectory(out_dir.join("trajectory.csv"), &aligned)?;
    write_trajectory(out_dir.join("ground_truth.csv"), &reference)?;

    let actual = to_records(&reference);
    let estimated = to_records(&aligned);
    let report = evaluate_wape(&actual, &estimated);
    println!("--- WAPE over {} frames (scale {:.4}) ---", report.num_pairs, scale);
    for row in report.rows() {
        match row.wape_percent {
            Some(v) => println!("{:>24}: {:.2}%", row.component, v),
            None => println!("{:>24}: n/a", row.component),
        }
    }
    write_wape(out_dir.join("wape.csv"), &report)?;

    let margins = difference_margins(&actual, &estimated);
    write_margins(out_dir.join("margins.csv"), &margins)?;
    if let (Some(a), Some(e)) = (actual.last(), estimated.last()) {
        println!("final position error: {:.4} m", (a.position() - e.position()).norm());
    }
    Ok(())
}
