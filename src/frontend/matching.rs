//! Correspondence utilities: landmark-id matching across frames and stereo
//! pairs, plus the disparity / triangulation-with-covariance helpers used by
//! the Tracker and downstream mapping.
//!
//! Everything here is a pure function over frame state.

use nalgebra::{Matrix3, Vector3};
use std::collections::HashMap;

use crate::frontend::camera::StereoCamera;
use crate::frontend::frame::{Frame, LandmarkId, StereoFrame};

/// Ordered `(ref_index, cur_index)` pairs sharing a landmark id.
pub type MatchesRefCur = Vec<(usize, usize)>;

/// Find keypoint pairs observing the same landmark in both frames.
///
/// The result is ordered by current-frame feature index.
pub fn find_matching_keypoints(ref_frame: &Frame, cur_frame: &Frame) -> MatchesRefCur {
    let mut ref_by_landmark: HashMap<LandmarkId, usize> = HashMap::new();
    for (idx, lm) in ref_frame.landmarks.iter().enumerate() {
        if let Some(id) = lm {
            ref_by_landmark.insert(*id, idx);
        }
    }

    let mut matches = Vec::new();
    for (cur_idx, lm) in cur_frame.landmarks.iter().enumerate() {
        if let Some(id) = lm {
            if let Some(&ref_idx) = ref_by_landmark.get(id) {
                matches.push((ref_idx, cur_idx));
            }
        }
    }
    matches
}

/// Stereo variant: additionally requires valid stereo depth on both sides.
pub fn find_matching_stereo_keypoints(
    ref_stereo: &StereoFrame,
    cur_stereo: &StereoFrame,
) -> MatchesRefCur {
    let mono = find_matching_keypoints(&ref_stereo.left_frame, &cur_stereo.left_frame);
    find_matching_stereo_keypoints_given_mono(ref_stereo, cur_stereo, &mono)
}

/// Restrict an existing mono match list by stereo validity instead of
/// recomputing the matches from scratch.
pub fn find_matching_stereo_keypoints_given_mono(
    ref_stereo: &StereoFrame,
    cur_stereo: &StereoFrame,
    matches_mono: &MatchesRefCur,
) -> MatchesRefCur {
    matches_mono
        .iter()
        .copied()
        .filter(|&(ref_idx, cur_idx)| {
            ref_stereo.is_stereo_valid(ref_idx) && cur_stereo.is_stereo_valid(cur_idx)
        })
        .collect()
}

/// Complement of an inlier index set against the full match list.
///
/// Order-preserving with respect to the input matches.
pub fn find_outliers(matches_ref_cur: &MatchesRefCur, inliers: &[usize]) -> Vec<usize> {
    let inlier_set: std::collections::HashSet<usize> = inliers.iter().copied().collect();
    (0..matches_ref_cur.len())
        .filter(|idx| !inlier_set.contains(idx))
        .collect()
}

/// Median pixel displacement between matched keypoints of two frames.
///
/// A cheap motion gate: callers use it to decide whether a keyframe or loop
/// check is worth attempting. Returns 0.0 when there are no matches.
pub fn compute_median_disparity(ref_frame: &Frame, cur_frame: &Frame) -> f64 {
    let matches = find_matching_keypoints(ref_frame, cur_frame);
    if matches.is_empty() {
        return 0.0;
    }

    let mut disparities: Vec<f64> = matches
        .iter()
        .map(|&(ref_idx, cur_idx)| {
            let d = cur_frame.keypoints[cur_idx] - ref_frame.keypoints[ref_idx];
            d.norm()
        })
        .collect();
    disparities.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    disparities[disparities.len() / 2]
}

/// Read a stereo landmark's 3D position and propagate a 2D/disparity
/// covariance into a 3x3 point covariance via the back-projection Jacobian.
///
/// `stereo_pt_cov` is the covariance of the rectified stereo measurement
/// (uL, uR, v). When `rotation` is given, both point and covariance are
/// rotated into that frame; absence means "leave in the left camera frame".
pub fn get_point3_and_covariance(
    stereo_frame: &StereoFrame,
    stereo_cam: &StereoCamera,
    point_id: usize,
    stereo_pt_cov: &Matrix3<f64>,
    rotation: Option<&Matrix3<f64>>,
) -> (Vector3<f64>, Matrix3<f64>) {
    assert!(
        point_id < stereo_frame.keypoints_3d.len(),
        "stereo point index out of range"
    );

    let point = stereo_frame.keypoints_3d[point_id];
    let left_kp = stereo_frame.left_frame.keypoints[point_id];

    // Reconstruct the rectified measurement from point depth.
    let disparity = stereo_cam.left.fx * stereo_cam.baseline / point.z;
    let jac = stereo_cam.back_project_jacobian(left_kp.x, left_kp.x - disparity, left_kp.y);

    let cov = jac * stereo_pt_cov * jac.transpose();

    match rotation {
        Some(r) => (r * point, r * cov * r.transpose()),
        None => (point, cov),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    use crate::frontend::camera::CameraParams;
    use crate::frontend::frame::KeypointStatus;

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

    fn frame_with_landmarks(landmarks: &[Option<LandmarkId>]) -> Frame {
        let camera = cam();
        let mut frame = Frame::new(0, 0);
        for (i, lm) in landmarks.iter().enumerate() {
            frame.push_keypoint(
                Point2::new(100.0 + 10.0 * i as f64, 100.0),
                *lm,
                1,
                &camera,
            );
        }
        frame
    }

    #[test]
    fn test_find_matching_keypoints_by_shared_landmark() {
        let ref_frame = frame_with_landmarks(&[Some(1), Some(2), None, Some(4)]);
        let cur_frame = frame_with_landmarks(&[Some(4), None, Some(2), Some(9)]);

        let matches = find_matching_keypoints(&ref_frame, &cur_frame);
        assert_eq!(matches, vec![(3, 0), (1, 2)]);
    }

    #[test]
    fn test_find_outliers_partitions_match_indices() {
        let matches: MatchesRefCur = (0..6).map(|i| (i, i)).collect();
        let inliers = vec![0, 2, 5];

        let outliers = find_outliers(&matches, &inliers);
        assert_eq!(outliers, vec![1, 3, 4]);

        // Union reconstructs the full index range exactly once each.
        let mut all: Vec<usize> = inliers.iter().chain(outliers.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..matches.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_stereo_matching_requires_valid_depth_both_sides() {
        let left_ref = frame_with_landmarks(&[Some(1), Some(2)]);
        let left_cur = frame_with_landmarks(&[Some(1), Some(2)]);
        let mut ref_stereo = StereoFrame::new(left_ref, Frame::new(0, 0));
        let mut cur_stereo = StereoFrame::new(left_cur, Frame::new(1, 0));

        ref_stereo.right_keypoints_status = vec![KeypointStatus::Valid, KeypointStatus::Valid];
        cur_stereo.right_keypoints_status =
            vec![KeypointStatus::Valid, KeypointStatus::NotFound];

        let matches = find_matching_stereo_keypoints(&ref_stereo, &cur_stereo);
        assert_eq!(matches, vec![(0, 0)]);
    }

    #[test]
    fn test_median_disparity_zero_motion() {
        let frame = frame_with_landmarks(&[Some(1), Some(2), Some(3)]);
        assert_relative_eq!(compute_median_disparity(&frame, &frame), 0.0);
    }

    #[test]
    fn test_median_disparity_uniform_shift() {
        let camera = cam();
        let ref_frame = frame_with_landmarks(&[Some(1), Some(2), Some(3)]);
        let mut cur_frame = Frame::new(1, 0);
        for (i, kp) in ref_frame.keypoints.iter().enumerate() {
            cur_frame.push_keypoint(
                Point2::new(kp.x + 3.0, kp.y + 4.0),
                ref_frame.landmarks[i],
                2,
                &camera,
            );
        }
        assert_relative_eq!(
            compute_median_disparity(&ref_frame, &cur_frame),
            5.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_point3_covariance_is_symmetric_and_grows_with_depth() {
        let stereo_cam = StereoCamera {
            left: cam(),
            baseline: 0.11,
        };

        let make_stereo = |depth: f64| {
            let camera = cam();
            let mut left = Frame::new(0, 0);
            left.push_keypoint(Point2::new(400.0, 250.0), Some(0), 1, &camera);
            let mut stereo = StereoFrame::new(left, Frame::new(0, 0));
            let kp = stereo.left_frame.keypoints[0];
            let x = (kp.x - camera.cx) / camera.fx * depth;
            let y = (kp.y - camera.cy) / camera.fy * depth;
            stereo.keypoints_3d[0] = Vector3::new(x, y, depth);
            stereo.right_keypoints_status[0] = KeypointStatus::Valid;
            stereo.keypoints_depth[0] = depth;
            stereo
        };

        let pix_cov = Matrix3::identity();
        let (p_near, cov_near) =
            get_point3_and_covariance(&make_stereo(2.0), &stereo_cam, 0, &pix_cov, None);
        let (_, cov_far) =
            get_point3_and_covariance(&make_stereo(8.0), &stereo_cam, 0, &pix_cov, None);

        assert_relative_eq!(p_near.z, 2.0, epsilon = 1e-9);
        assert_relative_eq!(cov_near, cov_near.transpose(), epsilon = 1e-9);
        // Depth uncertainty grows quadratically with range.
        assert!(cov_far[(2, 2)] > cov_near[(2, 2)]);
    }

    #[test]
    fn test_point3_covariance_optional_rotation() {
        let stereo_cam = StereoCamera {
            left: cam(),
            baseline: 0.11,
        };
        let camera = cam();
        let mut left = Frame::new(0, 0);
        left.push_keypoint(Point2::new(400.0, 250.0), Some(0), 1, &camera);
        let mut stereo = StereoFrame::new(left, Frame::new(0, 0));
        stereo.keypoints_3d[0] = Vector3::new(0.2, 0.1, 3.0);
        stereo.right_keypoints_status[0] = KeypointStatus::Valid;

        let pix_cov = Matrix3::identity();
        // Rotate camera frame to world: swap axes.
        let r = Matrix3::new(0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0);

        let (p_cam, cov_cam) =
            get_point3_and_covariance(&stereo, &stereo_cam, 0, &pix_cov, None);
        let (p_rot, cov_rot) =
            get_point3_and_covariance(&stereo, &stereo_cam, 0, &pix_cov, Some(&r));

        assert_relative_eq!(p_rot, r * p_cam, epsilon = 1e-12);
        assert_relative_eq!(cov_rot, r * cov_cam * r.transpose(), epsilon = 1e-12);
    }
}
