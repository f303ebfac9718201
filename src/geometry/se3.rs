//! SE3: 6-DOF rigid-body transformation (rotation + translation).
//!
//! Poses follow the `T_target_source` naming convention: `ref_pose_cur`
//! transforms a point expressed in the current frame into the reference
//! frame, `p_ref = R * p_cur + t`.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// 6-DOF rigid-body transformation.
///
/// Transforms points as: p' = R * p + t
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation (no rotation, no translation).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Convert to homogeneous 4x4 matrix of form [R | t; 0 0 0 1].
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let r = self.rotation_matrix();
        let t = self.translation;
        Matrix4::new(
            r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x,
            r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y,
            r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    /// Inverse transformation: T^{-1} = [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotate a vector (no translation).
    pub fn transform_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    /// Rotation magnitude in radians.
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
