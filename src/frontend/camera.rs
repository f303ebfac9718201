//! Camera models and the feature mask used during corner detection.
//!
//! Only the calibrated pinhole and rectified stereo cases are handled here;
//! distortion is assumed to be removed upstream, so lifting a pixel to a
//! bearing vector is a plain intrinsic inverse followed by normalization.

use nalgebra::{Matrix3, Point2, Vector3};
use serde::{Deserialize, Serialize};

use crate::frontend::frame::KeypointCv;

/// Pinhole intrinsics for one rectified camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraParams {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
}

impl CameraParams {
    /// Intrinsic matrix K.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Inverse intrinsic matrix K^{-1} (closed form for a pinhole K).
    pub fn k_inverse(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx, 0.0, -self.cx / self.fx,
            0.0, 1.0 / self.fy, -self.cy / self.fy,
            0.0, 0.0, 1.0,
        )
    }

    /// Lift a pixel to a unit-norm bearing vector in camera space.
    pub fn bearing(&self, kp: &KeypointCv) -> Vector3<f64> {
        let x = (kp.x - self.cx) / self.fx;
        let y = (kp.y - self.cy) / self.fy;
        Vector3::new(x, y, 1.0).normalize()
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns None for points at or behind the camera plane.
    pub fn project(&self, p: &Vector3<f64>) -> Option<KeypointCv> {
        if p.z <= 0.0 {
            return None;
        }
        Some(Point2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Whether a pixel lies inside the image bounds.
    pub fn contains(&self, kp: &KeypointCv) -> bool {
        kp.x >= 0.0 && kp.y >= 0.0 && kp.x < self.width as f64 && kp.y < self.height as f64
    }
}

/// Rectified stereo rig: left pinhole camera plus horizontal baseline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StereoCamera {
    pub left: CameraParams,
    /// Baseline in meters.
    pub baseline: f64,
}

impl StereoCamera {
    /// Back-project a rectified stereo measurement (uL, uR, v) to a 3D point
    /// in the left camera frame.
    ///
    /// Returns None for non-positive disparity.
    pub fn back_project(&self, u_left: f64, u_right: f64, v: f64) -> Option<Vector3<f64>> {
        let disparity = u_left - u_right;
        if disparity <= 0.0 {
            return None;
        }
        let z = self.left.fx * self.baseline / disparity;
        let x = (u_left - self.left.cx) / self.left.fx * z;
        let y = (v - self.left.cy) / self.left.fy * z;
        Some(Vector3::new(x, y, z))
    }

    /// Jacobian of `back_project` with respect to the stereo measurement
    /// (uL, uR, v), evaluated analytically.
    ///
    /// Rows are (x, y, z), columns are (uL, uR, v).
    pub fn back_project_jacobian(&self, u_left: f64, u_right: f64, v: f64) -> Matrix3<f64> {
        let fx = self.left.fx;
        let fy = self.left.fy;
        let d = u_left - u_right;
        let z = fx * self.baseline / d;

        let dz_dul = -fx * self.baseline / (d * d);
        let dz_dur = -dz_dul;

        let xn = (u_left - self.left.cx) / fx;
        let yn = (v - self.left.cy) / fy;

        Matrix3::new(
            z / fx + xn * dz_dul, xn * dz_dur, 0.0,
            yn * dz_dul, yn * dz_dur, z / fy,
            dz_dul, dz_dur, 0.0,
        )
    }
}

/// Occupancy mask preventing re-detection of corners next to tracked features.
///
/// The image is divided into cells of `min_distance` pixels; blocking a
/// keypoint marks its cell and the 8 neighbours as occupied.
#[derive(Debug, Clone)]
pub struct CameraMask {
    cells: Vec<bool>,
    cols: usize,
    rows: usize,
    cell_size: f64,
}

impl CameraMask {
    /// Create a fully-free mask for an image of the given size.
    pub fn new(width: u32, height: u32, min_distance: f64) -> Self {
        let cell_size = min_distance.max(1.0);
        let cols = (width as f64 / cell_size).ceil() as usize + 1;
        let rows = (height as f64 / cell_size).ceil() as usize + 1;
        Self {
            cells: vec![false; cols * rows],
            cols,
            rows,
            cell_size,
        }
    }

    fn cell_of(&self, kp: &KeypointCv) -> Option<(usize, usize)> {
        if kp.x < 0.0 || kp.y < 0.0 {
            return None;
        }
        let cx = (kp.x / self.cell_size) as usize;
        let cy = (kp.y / self.cell_size) as usize;
        if cx >= self.cols || cy >= self.rows {
            return None;
        }
        Some((cx, cy))
    }

    /// Mark the neighbourhood of a keypoint as occupied.
    pub fn block(&mut self, kp: &KeypointCv) {
        let Some((cx, cy)) = self.cell_of(kp) else {
            return;
        };
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let nx = cx as i64 + dx;
                let ny = cy as i64 + dy;
                if nx >= 0 && ny >= 0 && (nx as usize) < self.cols && (ny as usize) < self.rows {
                    self.cells[ny as usize * self.cols + nx as usize] = true;
                }
            }
        }
    }

    /// Whether a new corner may be placed at this location.
    pub fn is_free(&self, kp: &KeypointCv) -> bool {
        match self.cell_of(kp) {
            Some((cx, cy)) => !self.cells[cy * self.cols + cx],
            None => false,
        }
    }

    /// Reset every cell to free.
    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = false);
    }
}
