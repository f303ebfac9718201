//! Optical-flow prediction: where will tracked keypoints land in the next
//! frame?
//!
//! Prediction only narrows the search window for the downstream refiner; a
//! cheap rotation-only prior is used when a gyro rotation estimate is
//! available, degrading gracefully to the identity predictor otherwise.

use nalgebra::{Matrix3, Point2, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::frontend::camera::CameraParams;
use crate::frontend::frame::KeypointsCv;

/// Selects the concrete predictor built by [`make_optical_flow_predictor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpticalFlowPredictorType {
    Static,
    Rotational,
}

/// Predicts, for every keypoint in the previous frame, its expected pixel
/// location in the current frame.
pub trait OpticalFlowPredictor: Send {
    /// Predict flow for a set of keypoints.
    ///
    /// Returns None only when no valid prediction could be produced at all;
    /// per-point degradation falls back to the previous location instead.
    fn predict_flow(&self, prev_kps: &KeypointsCv) -> Option<KeypointsCv>;

    /// Supply a fresh inter-frame rotation estimate (last-write-wins).
    ///
    /// Ignored by predictors that carry no rotation state.
    fn update_inter_frame_rotation(&mut self, _rotation: &UnitQuaternion<f64>) {}
}

/// Assumes the camera did not move: features stay at the same pixel
/// positions. Zero-order baseline, always succeeds.
#[derive(Debug, Default)]
pub struct StaticOpticalFlowPredictor;

impl OpticalFlowPredictor for StaticOpticalFlowPredictor {
    fn predict_flow(&self, prev_kps: &KeypointsCv) -> Option<KeypointsCv> {
        Some(prev_kps.clone())
    }
}

/// Predicts flow from an inter-frame rotation guess, assuming zero
/// translation between frames.
///
/// Under a rotation-only motion model the homography `H = K * R * K^{-1}`
/// maps pixel bearings from the last frame into the current one.
#[derive(Debug)]
pub struct RotationalOpticalFlowPredictor {
    k: Matrix3<f64>,
    k_inverse: Matrix3<f64>,
    inter_frame_rotation: UnitQuaternion<f64>,
}

impl RotationalOpticalFlowPredictor {
    pub fn new(cam: &CameraParams) -> Self {
        Self {
            k: cam.k(),
            k_inverse: cam.k_inverse(),
            inter_frame_rotation: UnitQuaternion::identity(),
        }
    }
}

impl OpticalFlowPredictor for RotationalOpticalFlowPredictor {
    fn predict_flow(&self, prev_kps: &KeypointsCv) -> Option<KeypointsCv> {
        // lf_R_f takes a vector from the last frame to the current frame.
        let r = self.inter_frame_rotation.to_rotation_matrix().into_inner();
        let h = self.k * r * self.k_inverse;

        let mut next_kps = Vec::with_capacity(prev_kps.len());
        for kp in prev_kps {
            // Homogeneous lift with unit depth, rotate, re-project.
            let p1 = Vector3::new(kp.x, kp.y, 1.0);
            let p2 = h * p1;

            if p2.z > 0.0 {
                next_kps.push(Point2::new(p2.x / p2.z, p2.y / p2.z));
            } else {
                // Projection failed, keep old corner.
                next_kps.push(*kp);
            }
        }
        Some(next_kps)
    }

    fn update_inter_frame_rotation(&mut self, rotation: &UnitQuaternion<f64>) {
        self.inter_frame_rotation = *rotation;
    }
}

/// Factory selecting a predictor by configuration value.
pub fn make_optical_flow_predictor(
    predictor_type: OpticalFlowPredictorType,
    cam: &CameraParams,
) -> Box<dyn OpticalFlowPredictor> {
    match predictor_type {
        OpticalFlowPredictorType::Static => Box::new(StaticOpticalFlowPredictor),
        OpticalFlowPredictorType::Rotational => {
            Box::new(RotationalOpticalFlowPredictor::new(cam))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;

    fn cam() -> CameraParams {
        CameraParams {
            fx: 450.0,
            fy: 450.0,
            cx: 376.0,
            cy: 240.0,
            width: 752,
            height: 480,
        }
    }

    fn sample_kps() -> KeypointsCv {
        vec![
            Point2::new(100.0, 100.0),
            Point2::new(376.0, 240.0),
            Point2::new(700.0, 50.0),
        ]
    }

    #[test]
    fn test_static_predictor_is_identity() {
        let predictor = StaticOpticalFlowPredictor;
        let prev = sample_kps();
        let next = predictor.predict_flow(&prev).unwrap();
        assert_eq!(next, prev);
    }

    #[test]
    fn test_rotational_with_identity_rotation_matches_static() {
        let rotational = RotationalOpticalFlowPredictor::new(&cam());
        let prev = sample_kps();

        let next = rotational.predict_flow(&prev).unwrap();
        let baseline = StaticOpticalFlowPredictor.predict_flow(&prev).unwrap();
        for (a, b) in next.iter().zip(baseline.iter()) {
            assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
            assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rotational_predictor_shifts_keypoints() {
        let camera = cam();
        let mut rotational = RotationalOpticalFlowPredictor::new(&camera);

        // Small yaw rotates bearings, so predicted pixels must move.
        let rotation =
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::y()), 0.02);
        rotational.update_inter_frame_rotation(&rotation);

        let prev = vec![Point2::new(camera.cx, camera.cy)];
        let next = rotational.predict_flow(&prev).unwrap();
        assert!((next[0].x - prev[0].x).abs() > 1.0);
    }

    #[test]
    fn test_rotational_predictor_last_write_wins() {
        let camera = cam();
        let mut rotational = RotationalOpticalFlowPredictor::new(&camera);

        let rot_a =
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::y()), 0.1);
        rotational.update_inter_frame_rotation(&rot_a);
        rotational.update_inter_frame_rotation(&UnitQuaternion::identity());

        let prev = sample_kps();
        let next = rotational.predict_flow(&prev).unwrap();
        for (a, b) in next.iter().zip(prev.iter()) {
            assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_behind_camera_falls_back_to_previous_location() {
        let camera = cam();
        let mut rotational = RotationalOpticalFlowPredictor::new(&camera);

        // A 150 degree pitch pushes forward bearings behind the camera.
        let rotation = UnitQuaternion::from_axis_angle(
            &Unit::new_normalize(Vector3::x()),
            150f64.to_radians(),
        );
        rotational.update_inter_frame_rotation(&rotation);

        let prev = vec![Point2::new(camera.cx, camera.cy)];
        let next = rotational.predict_flow(&prev).unwrap();
        assert_relative_eq!(next[0].x, prev[0].x, epsilon = 1e-12);
        assert_relative_eq!(next[0].y, prev[0].y, epsilon = 1e-12);
    }

    #[test]
    fn test_factory_builds_requested_variant() {
        let camera = cam();
        let static_pred =
            make_optical_flow_predictor(OpticalFlowPredictorType::Static, &camera);
        let rotational_pred =
            make_optical_flow_predictor(OpticalFlowPredictorType::Rotational, &camera);

        let prev = sample_kps();
        assert!(static_pred.predict_flow(&prev).is_some());
        assert!(rotational_pred.predict_flow(&prev).is_some());
    }
}
