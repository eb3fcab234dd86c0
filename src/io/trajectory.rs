//! Trajectory files in the TUM layout, as CSV.
//!
//! One row per frame: `timestamp,x,y,z,qx,qy,qz,qw`, where the position and
//! orientation are those of the camera in the world (`T_wc`). Lines starting
//! with `#` are ignored when reading.

use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::tracking::StampedPose;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub qw: f64,
}

impl TrajectoryRecord {
    pub fn from_pose_cw(timestamp: f64, pose_cw: &SE3) -> Self {
        let twc = pose_cw.inverse();
        let q = twc.rotation.quaternion();
        Self {
            timestamp,
            x: twc.translation.x,
            y: twc.translation.y,
            z: twc.translation.z,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            qw: q.w,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// Camera orientation in the world, normalized.
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_quaternion(Quaternion::new(self.qw, self.qx, self.qy, self.qz))
    }

    pub fn pose_cw(&self) -> SE3 {
        SE3 {
            rotation: self.orientation(),
            translation: self.position(),
        }
        .inverse()
    }
}

/// Write `poses` (`T_cw`) as camera-in-world rows.
pub fn write_trajectory<P: AsRef<Path>>(path: P, poses: &[StampedPose]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["#timestamp", "x", "y", "z", "qx", "qy", "qz", "qw"])?;
    for p in poses {
        writer.serialize(TrajectoryRecord::from_pose_cw(p.timestamp, &p.pose))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a trajectory file. Frame ids are the row indices.
pub fn read_trajectory<P: AsRef<Path>>(path: P) -> Result<Vec<StampedPose>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut poses = Vec::new();
    for (i, record) in reader.deserialize::<TrajectoryRecord>().enumerate() {
        let record = record.with_context(|| format!("{}: bad row {}", path.display(), i + 1))?;
        poses.push(StampedPose {
            frame_id: i as u64,
            timestamp: record.timestamp,
            pose: record.pose_cw(),
        });
    }
    Ok(poses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_written_rows_hold_camera_centers() {
        let twc = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        let poses = vec![StampedPose {
            frame_id: 0,
            timestamp: 0.5,
            pose: twc.inverse(),
        }];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traj.csv");

        write_trajectory(&path, &poses).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#timestamp"));

        let back = read_trajectory(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_relative_eq!(back[0].pose.camera_center(), Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-9);
        assert!(back[0].pose.rotation.angle_to(&poses[0].pose.rotation) < 1e-9);
    }

    #[test]
    fn test_read_skips_comments_and_rejects_short_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# tum trajectory").unwrap();
        writeln!(file, "1.0, 0, 0, 1, 0, 0, 0, 1").unwrap();
        file.flush().unwrap();
        let poses = read_trajectory(file.path()).unwrap();
        assert_eq!(poses.len(), 1);
        assert_relative_eq!(poses[0].pose.camera_center().z, 1.0, epsilon = 1e-12);

        writeln!(file, "2.0, 0, 0").unwrap();
        file.flush().unwrap();
        assert!(read_trajectory(file.path()).is_err());
    }
}
