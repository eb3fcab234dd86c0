//! Pinhole camera with radial-tangential distortion.
//!
//! Keypoints are undistorted once when a frame is built; everything downstream
//! (matching by projection, triangulation, optimization) works with the ideal
//! pinhole model.

use nalgebra::{Matrix3, Vector2, Vector3};

/// Pinhole intrinsics plus OpenCV-style `k1 k2 p1 p2 k3` distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
}

/// Fixed-point iterations for undistortion.
const UNDISTORT_ITERATIONS: usize = 10;

impl CameraModel {
    /// Distortion-free pinhole camera.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
            width,
            height,
        }
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0 || self.k3 != 0.0
    }

    /// Intrinsic matrix K.
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Project a camera-frame point. `None` for points at or behind the camera.
    #[inline]
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Pixel to normalized image plane (`z = 1`), no undistortion.
    #[inline]
    pub fn unproject(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new((uv.x - self.cx) / self.fx, (uv.y - self.cy) / self.fy, 1.0)
    }

    /// True if the pixel lies inside the image rectangle.
    #[inline]
    pub fn is_in_image(&self, uv: &Vector2<f64>) -> bool {
        uv.x >= 0.0 && uv.y >= 0.0 && uv.x < self.width as f64 && uv.y < self.height as f64
    }

    /// Apply the distortion model to a normalized point.
    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Distort an ideal pixel (inverse of [`CameraModel::undistort_point`]).
    pub fn distort_point(&self, uv: &Vector2<f64>) -> Vector2<f64> {
        let n = self.unproject(uv);
        let (xd, yd) = self.distort_normalized(n.x, n.y);
        Vector2::new(self.fx * xd + self.cx, self.fy * yd + self.cy)
    }

    /// Remove lens distortion from a measured pixel.
    pub fn undistort_point(&self, uv: &Vector2<f64>) -> Vector2<f64> {
        if !self.has_distortion() {
            return *uv;
        }
        let xd = (uv.x - self.cx) / self.fx;
        let yd = (uv.y - self.cy) / self.fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Vector2::new(self.fx * x + self.cx, self.fy * y + self.cy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    #[test]
    fn test_project_unproject() {
        let cam = camera();
        let p = Vector3::new(0.4, -0.2, 2.0);
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(uv, Vector2::new(420.0, 190.0), epsilon = 1e-12);
        let ray = cam.unproject(&uv);
        assert_relative_eq!(ray * 2.0, p, epsilon = 1e-12);
    }

    #[test]
    fn test_project_behind_camera() {
        assert!(camera().project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let mut cam = camera();
        cam.k1 = -0.28;
        cam.k2 = 0.07;
        cam.p1 = 0.0002;
        cam.p2 = -0.0001;
        let ideal = Vector2::new(100.0, 400.0);
        let distorted = cam.distort_point(&ideal);
        let recovered = cam.undistort_point(&distorted);
        assert_relative_eq!(recovered, ideal, epsilon = 1e-3);
    }
}
