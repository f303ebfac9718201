//! Frame and stereo-frame data model consumed and mutated by the Tracker.
//!
//! A `Frame` owns index-aligned keypoint, landmark-id, age and bearing lists:
//! entry `i` of every list describes the same feature. The Tracker is the
//! single writer; everything else reads.

use nalgebra::{Point2, Vector3};

use crate::frontend::camera::CameraParams;

/// Identifier for a frame in the input sequence.
pub type FrameId = u64;
/// Timestamp in nanoseconds.
pub type Timestamp = i64;
/// Unique identifier tying the same scene point across frames.
pub type LandmarkId = u64;

/// 2D pixel location of a feature.
pub type KeypointCv = Point2<f64>;
/// Ordered keypoint list; insertion order is the feature index.
pub type KeypointsCv = Vec<KeypointCv>;

/// Stereo status of a right-image keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypointStatus {
    /// Stereo correspondence found, depth valid.
    Valid,
    /// No correspondence found in the right image.
    NotFound,
    /// Correspondence fell outside the right image bounds.
    OutsideImage,
    /// Triangulated depth outside the configured range.
    OutsideDepth,
}

/// One camera frame with its tracked features.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: Timestamp,
    /// Feature pixel locations; index-aligned with all lists below.
    pub keypoints: KeypointsCv,
    /// Landmark id per keypoint; None = unassigned (dropped or outlier).
    pub landmarks: Vec<Option<LandmarkId>>,
    /// Number of consecutive frames each feature has been tracked.
    pub landmarks_age: Vec<u64>,
    /// Unit bearing vector per keypoint.
    pub versors: Vec<Vector3<f64>>,
}

impl Frame {
    /// Create an empty frame.
    pub fn new(id: FrameId, timestamp: Timestamp) -> Self {
        Self {
            id,
            timestamp,
            keypoints: Vec::new(),
            landmarks: Vec::new(),
            landmarks_age: Vec::new(),
            versors: Vec::new(),
        }
    }

    /// Append one feature, keeping all lists aligned.
    pub fn push_keypoint(
        &mut self,
        kp: KeypointCv,
        landmark: Option<LandmarkId>,
        age: u64,
        cam: &CameraParams,
    ) {
        self.versors.push(cam.bearing(&kp));
        self.keypoints.push(kp);
        self.landmarks.push(landmark);
        self.landmarks_age.push(age);
    }

    /// Number of features currently assigned a landmark id.
    pub fn num_tracked(&self) -> usize {
        self.landmarks.iter().filter(|l| l.is_some()).count()
    }

    /// Total feature count.
    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Index-alignment invariant; violations are a broken caller contract.
    pub fn check_alignment(&self) {
        let n = self.keypoints.len();
        assert_eq!(self.landmarks.len(), n, "landmark list out of alignment");
        assert_eq!(self.landmarks_age.len(), n, "age list out of alignment");
        assert_eq!(self.versors.len(), n, "versor list out of alignment");
    }
}

/// A rectified stereo pair plus per-feature depth information.
///
/// The left frame carries the tracked features; `keypoints_3d`,
/// `right_keypoints_status` and `keypoints_depth` are index-aligned with it.
#[derive(Debug, Clone)]
pub struct StereoFrame {
    pub left_frame: Frame,
    pub right_frame: Frame,
    /// Triangulated 3D point per left keypoint, in the left camera frame.
    /// Only meaningful where the status is `Valid`.
    pub keypoints_3d: Vec<Vector3<f64>>,
    pub right_keypoints_status: Vec<KeypointStatus>,
    pub keypoints_depth: Vec<f64>,
}

impl StereoFrame {
    pub fn new(left_frame: Frame, right_frame: Frame) -> Self {
        let n = left_frame.num_features();
        Self {
            left_frame,
            right_frame,
            keypoints_3d: vec![Vector3::zeros(); n],
            right_keypoints_status: vec![KeypointStatus::NotFound; n],
            keypoints_depth: vec![0.0; n],
        }
    }

    /// Whether left keypoint `idx` has a valid stereo correspondence.
    pub fn is_stereo_valid(&self, idx: usize) -> bool {
        matches!(self.right_keypoints_status.get(idx), Some(KeypointStatus::Valid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;

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

    #[test]
    fn test_push_keypoint_keeps_alignment() {
        let mut frame = Frame::new(0, 0);
        frame.push_keypoint(Point2::new(100.0, 100.0), Some(3), 1, &cam());
        frame.push_keypoint(Point2::new(200.0, 150.0), None, 0, &cam());

        frame.check_alignment();
        assert_eq!(frame.num_features(), 2);
        assert_eq!(frame.num_tracked(), 1);
    }

    #[test]
    fn test_stereo_validity_tracks_status() {
        let mut left = Frame::new(0, 0);
        left.push_keypoint(Point2::new(100.0, 100.0), Some(0), 1, &cam());
        let right = Frame::new(0, 0);

        let mut stereo = StereoFrame::new(left, right);
        assert!(!stereo.is_stereo_valid(0));

        stereo.right_keypoints_status[0] = KeypointStatus::Valid;
        assert!(stereo.is_stereo_valid(0));
        assert!(!stereo.is_stereo_valid(5));
    }
}
