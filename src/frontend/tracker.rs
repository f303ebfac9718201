//! Feature tracker: detection bookkeeping, flow-guided tracking, and the
//! geometric outlier-rejection entry points between a reference and a
//! current (stereo) frame.
//!
//! One instance is single-threaded and owns the monotone landmark-id
//! counter: ids are handed out once and never reused, so downstream modules
//! can key maps by landmark id across the whole run.
//!
//! All recovered poses follow the `ref_Pose_cur` convention: the returned
//! transform maps current-frame points into the reference frame.

use std::time::Instant;

use anyhow::{bail, Result};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frontend::camera::{CameraMask, StereoCamera};
use crate::frontend::frame::{
    Frame, KeypointCv, KeypointStatus, KeypointsCv, LandmarkId, StereoFrame,
};
use crate::frontend::matching::{
    compute_median_disparity, find_matching_keypoints, find_matching_stereo_keypoints,
    find_outliers, get_point3_and_covariance, MatchesRefCur,
};
use crate::frontend::optical_flow::{
    make_optical_flow_predictor, OpticalFlowPredictor, OpticalFlowPredictorType,
};
use crate::frontend::ransac::{
    ransac_alignment_arun, ransac_relative_pose_mono, ransac_translation_given_rotation_mono,
    ransac_translation_given_rotation_stereo, MonoRansacConfig, StereoRansacConfig,
};
use crate::geometry::SE3;

/// Tracker configuration, loaded from config files at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerParams {
    /// Feature budget per frame.
    pub max_features: usize,
    /// Minimum pixel distance between detected corners.
    pub min_distance: f64,
    /// Corners below `quality_level * best_score` are discarded.
    pub quality_level: f64,
    /// Half-size of the refinement search window, pixels.
    pub klt_window: usize,
    /// Features older than this many frames are retired.
    pub max_age: u64,
    pub ransac_max_iterations: usize,
    pub ransac_probability: f64,
    /// Mono inlier threshold on the epipolar residual (angular units).
    pub mono_threshold: f64,
    /// Stereo inlier threshold in meters.
    pub stereo_threshold_m: f64,
    pub min_mono_inliers: usize,
    pub min_stereo_inliers: usize,
    /// Median-disparity keyframe gate, pixels.
    pub disparity_threshold_px: f64,
    /// Standard deviation of the rectified stereo measurement (uL, uR, v).
    pub stereo_measurement_sigma_px: f64,
    pub optical_flow_predictor: OpticalFlowPredictorType,
    /// When false every rejection entry point short-circuits with `Disabled`.
    pub tracking_enabled: bool,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_features: 300,
            min_distance: 10.0,
            quality_level: 0.01,
            klt_window: 24,
            max_age: 25,
            ransac_max_iterations: 300,
            ransac_probability: 0.99,
            mono_threshold: 1e-3,
            stereo_threshold_m: 0.15,
            min_mono_inliers: 10,
            min_stereo_inliers: 6,
            disparity_threshold_px: 0.5,
            stereo_measurement_sigma_px: 1.0,
            optical_flow_predictor: OpticalFlowPredictorType::Static,
            tracking_enabled: true,
        }
    }
}

impl TrackerParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_features == 0 {
            bail!("max_features must be positive");
        }
        if self.min_distance <= 0.0 {
            bail!("min_distance must be positive");
        }
        if !(self.ransac_probability > 0.0 && self.ransac_probability < 1.0) {
            bail!(
                "ransac_probability must lie in (0, 1), got {}",
                self.ransac_probability
            );
        }
        if self.mono_threshold <= 0.0 || self.stereo_threshold_m <= 0.0 {
            bail!("RANSAC thresholds must be positive");
        }
        Ok(())
    }
}

/// Outcome of a geometric-verification attempt. Callers must branch on this
/// before trusting the accompanying pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    /// Estimation succeeded; the pose is meaningful.
    Valid,
    /// Too few correspondences to attempt (or to trust) estimation.
    FewMatches,
    /// Median disparity below the keyframe gate; scene barely moved.
    LowDisparity,
    /// Estimation failed or was degenerate.
    Invalid,
    /// Tracking intentionally disabled by configuration.
    Disabled,
}

/// Per-call diagnostic counters, overwritten by each tracker operation.
#[derive(Debug, Clone, Default)]
pub struct DebugTrackerInfo {
    pub nr_detected_features: usize,
    pub nr_tracked_features: usize,
    pub nr_mono_putatives: usize,
    pub nr_mono_inliers: usize,
    pub mono_ransac_iters: usize,
    pub nr_stereo_putatives: usize,
    pub nr_stereo_inliers: usize,
    pub stereo_ransac_iters: usize,
    pub nr_valid_rkp: usize,
    pub nr_not_found_rkp: usize,
    pub nr_outside_image_rkp: usize,
    pub nr_outside_depth_rkp: usize,
    pub feature_detection_time_ms: f64,
    pub feature_tracking_time_ms: f64,
    pub mono_ransac_time_ms: f64,
    pub stereo_ransac_time_ms: f64,
}

/// Corner extraction boundary. Implementations look at image data the
/// tracker never sees; the tracker only supplies the occupancy mask and the
/// remaining feature budget.
pub trait CornerDetector: Send {
    /// Detect up to `need_n_corners` corners in unmasked regions, returning
    /// pixel locations and response scores (index-aligned).
    fn detect(
        &self,
        frame: &Frame,
        mask: &CameraMask,
        need_n_corners: usize,
    ) -> (KeypointsCv, Vec<f64>);
}

/// Local flow refinement boundary (KLT or equivalent). `None` at index `i`
/// means the correspondence for reference keypoint `i` was lost.
pub trait FlowRefiner: Send {
    fn refine(&self, ref_frame: &Frame, predicted: &KeypointsCv) -> Vec<Option<KeypointCv>>;
}

pub struct Tracker {
    params: TrackerParams,
    stereo_camera: StereoCamera,
    cam_mask: CameraMask,
    /// Monotone landmark-id counter; never reset, never reused.
    landmark_count: LandmarkId,
    pub debug_info: DebugTrackerInfo,
    predictor: Box<dyn OpticalFlowPredictor>,
    detector: Box<dyn CornerDetector>,
    refiner: Box<dyn FlowRefiner>,
}

impl Tracker {
    pub fn new(
        params: TrackerParams,
        stereo_camera: StereoCamera,
        detector: Box<dyn CornerDetector>,
        refiner: Box<dyn FlowRefiner>,
    ) -> Result<Self> {
        params.validate()?;
        let cam_mask = CameraMask::new(
            stereo_camera.left.width,
            stereo_camera.left.height,
            params.min_distance,
        );
        let predictor =
            make_optical_flow_predictor(params.optical_flow_predictor, &stereo_camera.left);
        Ok(Self {
            params,
            stereo_camera,
            cam_mask,
            landmark_count: 0,
            debug_info: DebugTrackerInfo::default(),
            predictor,
            detector,
            refiner,
        })
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn landmark_count(&self) -> LandmarkId {
        self.landmark_count
    }

    /// Forward a gyro-derived inter-frame rotation to the flow predictor.
    pub fn update_inter_frame_rotation(&mut self, rotation: &UnitQuaternion<f64>) {
        self.predictor.update_inter_frame_rotation(rotation);
    }

    /// Detect new corners away from tracked features and append them to the
    /// frame with fresh landmark ids.
    pub fn feature_detection(&mut self, cur_frame: &mut Frame) {
        let start = Instant::now();
        cur_frame.check_alignment();

        self.cam_mask.clear();
        for kp in &cur_frame.keypoints {
            self.cam_mask.block(kp);
        }

        let need = self.params.max_features.saturating_sub(cur_frame.num_features());
        let mut added = 0usize;
        if need > 0 {
            let (corners, _scores) =
                self.feature_detection_with_scores(cur_frame, &self.cam_mask, need);
            for kp in corners {
                if !self.cam_mask.is_free(&kp) {
                    continue;
                }
                let id = self.landmark_count;
                self.landmark_count += 1;
                cur_frame.push_keypoint(kp, Some(id), 0, &self.stereo_camera.left);
                self.cam_mask.block(&kp);
                added += 1;
            }
        }

        self.debug_info.nr_detected_features = added;
        self.debug_info.feature_detection_time_ms = start.elapsed().as_secs_f64() * 1e3;
        debug!(
            frame = cur_frame.id,
            detected = added,
            total = cur_frame.num_features(),
            "feature detection"
        );
    }

    /// Detection without tracker mutation: run the detector, apply the
    /// quality filter, cap at the requested count.
    pub fn feature_detection_with_scores(
        &self,
        frame: &Frame,
        mask: &CameraMask,
        need_n_corners: usize,
    ) -> (KeypointsCv, Vec<f64>) {
        let (corners, scores) = self.detector.detect(frame, mask, need_n_corners);
        debug_assert_eq!(corners.len(), scores.len());

        let best = scores.iter().cloned().fold(0.0f64, f64::max);
        let cutoff = self.params.quality_level * best;

        let mut kept_corners = Vec::new();
        let mut kept_scores = Vec::new();
        for (kp, score) in corners.into_iter().zip(scores) {
            if score < cutoff || !self.stereo_camera.left.contains(&kp) {
                continue;
            }
            kept_corners.push(kp);
            kept_scores.push(score);
            if kept_corners.len() == need_n_corners {
                break;
            }
        }
        (kept_corners, kept_scores)
    }

    /// Track reference-frame features into the current frame: predict flow,
    /// refine locally, carry landmark ids forward. Lost correspondences are
    /// simply not propagated; this never fails.
    pub fn feature_tracking(&mut self, ref_frame: &Frame, cur_frame: &mut Frame) {
        let start = Instant::now();
        ref_frame.check_alignment();

        let predicted = self
            .predictor
            .predict_flow(&ref_frame.keypoints)
            .unwrap_or_else(|| ref_frame.keypoints.clone());
        let refined = self.refiner.refine(ref_frame, &predicted);
        debug_assert_eq!(refined.len(), ref_frame.num_features());

        let mut tracked = 0usize;
        for (i, refined_kp) in refined.iter().enumerate() {
            let Some(landmark) = ref_frame.landmarks[i] else {
                continue;
            };
            let age = ref_frame.landmarks_age[i] + 1;
            if age > self.params.max_age {
                continue;
            }
            if let Some(kp) = refined_kp {
                if self.stereo_camera.left.contains(kp) {
                    cur_frame.push_keypoint(*kp, Some(landmark), age, &self.stereo_camera.left);
                    tracked += 1;
                }
            }
        }

        self.debug_info.nr_tracked_features = tracked;
        self.debug_info.feature_tracking_time_ms = start.elapsed().as_secs_f64() * 1e3;
        debug!(
            ref_frame = ref_frame.id,
            cur_frame = cur_frame.id,
            tracked,
            of = ref_frame.num_tracked(),
            "feature tracking"
        );
    }

    fn mono_config(&self) -> MonoRansacConfig {
        MonoRansacConfig {
            max_iterations: self.params.ransac_max_iterations,
            threshold: self.params.mono_threshold,
            min_inliers: self.params.min_mono_inliers,
            probability: self.params.ransac_probability,
        }
    }

    fn stereo_config(&self) -> StereoRansacConfig {
        StereoRansacConfig {
            max_iterations: self.params.ransac_max_iterations,
            threshold_m: self.params.stereo_threshold_m,
            min_inliers: self.params.min_stereo_inliers,
            probability: self.params.ransac_probability,
        }
    }

    fn matched_bearings(
        ref_frame: &Frame,
        cur_frame: &Frame,
        matches: &MatchesRefCur,
    ) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>) {
        let f_ref = matches.iter().map(|&(r, _)| ref_frame.versors[r]).collect();
        let f_cur = matches.iter().map(|&(_, c)| cur_frame.versors[c]).collect();
        (f_ref, f_cur)
    }

    /// 2D-2D outlier rejection: recover `ref_Pose_cur` up to translation
    /// scale and unassign landmarks on rejected matches.
    pub fn geometric_outlier_rejection_mono(
        &mut self,
        ref_frame: &mut Frame,
        cur_frame: &mut Frame,
    ) -> (TrackingStatus, SE3) {
        if !self.params.tracking_enabled {
            return (TrackingStatus::Disabled, SE3::identity());
        }
        let start = Instant::now();

        let matches = find_matching_keypoints(ref_frame, cur_frame);
        self.debug_info.nr_mono_putatives = matches.len();
        if matches.len() < self.params.min_mono_inliers.max(8) {
            debug!(putatives = matches.len(), "mono rejection: too few matches");
            return (TrackingStatus::FewMatches, SE3::identity());
        }

        let (f_ref, f_cur) = Self::matched_bearings(ref_frame, cur_frame, &matches);
        let result = ransac_relative_pose_mono(&f_ref, &f_cur, &self.mono_config());
        self.debug_info.mono_ransac_time_ms = start.elapsed().as_secs_f64() * 1e3;

        match result {
            Some(result) => {
                self.debug_info.nr_mono_inliers = result.inliers.len();
                self.debug_info.mono_ransac_iters = result.iterations;
                Self::remove_outliers_mono(ref_frame, cur_frame, &matches, &result.inliers);
                debug!(
                    inliers = result.inliers.len(),
                    putatives = matches.len(),
                    iterations = result.iterations,
                    "mono rejection"
                );
                (TrackingStatus::Valid, result.pose)
            }
            None => {
                warn!(putatives = matches.len(), "mono RANSAC failed");
                (TrackingStatus::Invalid, SE3::identity())
            }
        }
    }

    /// Mono rejection when the inter-frame rotation is externally known:
    /// only the translation direction is estimated.
    pub fn geometric_outlier_rejection_mono_given_rotation(
        &mut self,
        ref_frame: &mut Frame,
        cur_frame: &mut Frame,
        rotation: &UnitQuaternion<f64>,
    ) -> (TrackingStatus, SE3) {
        if !self.params.tracking_enabled {
            return (TrackingStatus::Disabled, SE3::identity());
        }
        let start = Instant::now();

        let matches = find_matching_keypoints(ref_frame, cur_frame);
        self.debug_info.nr_mono_putatives = matches.len();
        if matches.len() < self.params.min_mono_inliers.max(2) {
            return (TrackingStatus::FewMatches, SE3::identity());
        }

        let (f_ref, f_cur) = Self::matched_bearings(ref_frame, cur_frame, &matches);
        let result = ransac_translation_given_rotation_mono(
            &f_ref,
            &f_cur,
            rotation,
            &self.mono_config(),
        );
        self.debug_info.mono_ransac_time_ms = start.elapsed().as_secs_f64() * 1e3;

        match result {
            Some(result) => {
                self.debug_info.nr_mono_inliers = result.inliers.len();
                self.debug_info.mono_ransac_iters = result.iterations;
                Self::remove_outliers_mono(ref_frame, cur_frame, &matches, &result.inliers);
                (TrackingStatus::Valid, result.pose)
            }
            None => {
                warn!(putatives = matches.len(), "mono given-rotation RANSAC failed");
                (TrackingStatus::Invalid, SE3::identity())
            }
        }
    }

    /// 3D-3D outlier rejection via Arun alignment: full 6-DoF `ref_Pose_cur`
    /// with metric translation.
    pub fn geometric_outlier_rejection_stereo(
        &mut self,
        ref_stereo: &mut StereoFrame,
        cur_stereo: &mut StereoFrame,
    ) -> (TrackingStatus, SE3) {
        if !self.params.tracking_enabled {
            return (TrackingStatus::Disabled, SE3::identity());
        }
        let start = Instant::now();

        let matches = find_matching_stereo_keypoints(ref_stereo, cur_stereo);
        self.debug_info.nr_stereo_putatives = matches.len();
        if matches.len() < self.params.min_stereo_inliers.max(3) {
            debug!(putatives = matches.len(), "stereo rejection: too few matches");
            return (TrackingStatus::FewMatches, SE3::identity());
        }

        let points_ref: Vec<Vector3<f64>> =
            matches.iter().map(|&(r, _)| ref_stereo.keypoints_3d[r]).collect();
        let points_cur: Vec<Vector3<f64>> =
            matches.iter().map(|&(_, c)| cur_stereo.keypoints_3d[c]).collect();

        let result = ransac_alignment_arun(&points_ref, &points_cur, &self.stereo_config());
        self.debug_info.stereo_ransac_time_ms = start.elapsed().as_secs_f64() * 1e3;

        match result {
            Some(result) => {
                self.debug_info.nr_stereo_inliers = result.inliers.len();
                self.debug_info.stereo_ransac_iters = result.iterations;
                Self::remove_outliers_stereo(ref_stereo, cur_stereo, &matches, &result.inliers);
                debug!(
                    inliers = result.inliers.len(),
                    putatives = matches.len(),
                    iterations = result.iterations,
                    "stereo rejection"
                );
                (TrackingStatus::Valid, result.pose)
            }
            None => {
                warn!(putatives = matches.len(), "stereo RANSAC failed");
                (TrackingStatus::Invalid, SE3::identity())
            }
        }
    }

    /// Stereo rejection with externally known rotation: 1-point translation
    /// voting. Also returns the 3x3 translation covariance for downstream
    /// factor weighting.
    pub fn geometric_outlier_rejection_stereo_given_rotation(
        &mut self,
        ref_stereo: &mut StereoFrame,
        cur_stereo: &mut StereoFrame,
        rotation: &UnitQuaternion<f64>,
    ) -> ((TrackingStatus, SE3), Matrix3<f64>) {
        if !self.params.tracking_enabled {
            return ((TrackingStatus::Disabled, SE3::identity()), Matrix3::zeros());
        }
        let start = Instant::now();

        let matches = find_matching_stereo_keypoints(ref_stereo, cur_stereo);
        self.debug_info.nr_stereo_putatives = matches.len();
        if matches.len() < self.params.min_stereo_inliers.max(1) {
            return ((TrackingStatus::FewMatches, SE3::identity()), Matrix3::zeros());
        }

        let sigma = self.params.stereo_measurement_sigma_px;
        let stereo_pt_cov = Matrix3::identity() * (sigma * sigma);

        let mut points_ref = Vec::with_capacity(matches.len());
        let mut points_cur = Vec::with_capacity(matches.len());
        let mut covs_ref = Vec::with_capacity(matches.len());
        let mut covs_cur = Vec::with_capacity(matches.len());
        for &(r, c) in &matches {
            let (p_ref, cov_ref) =
                get_point3_and_covariance(ref_stereo, &self.stereo_camera, r, &stereo_pt_cov, None);
            let (p_cur, cov_cur) =
                get_point3_and_covariance(cur_stereo, &self.stereo_camera, c, &stereo_pt_cov, None);
            points_ref.push(p_ref);
            points_cur.push(p_cur);
            covs_ref.push(cov_ref);
            covs_cur.push(cov_cur);
        }

        let result = ransac_translation_given_rotation_stereo(
            &points_ref,
            &points_cur,
            &covs_ref,
            &covs_cur,
            rotation,
            &self.stereo_config(),
        );
        self.debug_info.stereo_ransac_time_ms = start.elapsed().as_secs_f64() * 1e3;

        match result {
            Some(result) => {
                self.debug_info.nr_stereo_inliers = result.inliers.len();
                self.debug_info.stereo_ransac_iters = result.iterations;
                Self::remove_outliers_stereo(ref_stereo, cur_stereo, &matches, &result.inliers);
                let pose = SE3 {
                    rotation: *rotation,
                    translation: result.translation,
                };
                ((TrackingStatus::Valid, pose), result.covariance)
            }
            None => {
                warn!(putatives = matches.len(), "stereo given-rotation RANSAC failed");
                ((TrackingStatus::Invalid, SE3::identity()), Matrix3::zeros())
            }
        }
    }

    /// Unassign landmark ids on non-inlier matches in both frames.
    /// Idempotent: repeated application with the same inlier set is a no-op.
    pub fn remove_outliers_mono(
        ref_frame: &mut Frame,
        cur_frame: &mut Frame,
        matches: &MatchesRefCur,
        inliers: &[usize],
    ) {
        for idx in find_outliers(matches, inliers) {
            let (ref_idx, cur_idx) = matches[idx];
            ref_frame.landmarks[ref_idx] = None;
            cur_frame.landmarks[cur_idx] = None;
        }
    }

    /// Stereo variant of [`Tracker::remove_outliers_mono`], operating on the
    /// left frames of both stereo pairs.
    pub fn remove_outliers_stereo(
        ref_stereo: &mut StereoFrame,
        cur_stereo: &mut StereoFrame,
        matches: &MatchesRefCur,
        inliers: &[usize],
    ) {
        for idx in find_outliers(matches, inliers) {
            let (ref_idx, cur_idx) = matches[idx];
            ref_stereo.left_frame.landmarks[ref_idx] = None;
            cur_stereo.left_frame.landmarks[cur_idx] = None;
        }
    }

    /// Aggregate right-keypoint status counts into the debug info. Counting
    /// only; no tracking-state effect.
    pub fn check_status_right_keypoints(&mut self, statuses: &[KeypointStatus]) {
        self.debug_info.nr_valid_rkp = 0;
        self.debug_info.nr_not_found_rkp = 0;
        self.debug_info.nr_outside_image_rkp = 0;
        self.debug_info.nr_outside_depth_rkp = 0;
        for status in statuses {
            match status {
                KeypointStatus::Valid => self.debug_info.nr_valid_rkp += 1,
                KeypointStatus::NotFound => self.debug_info.nr_not_found_rkp += 1,
                KeypointStatus::OutsideImage => self.debug_info.nr_outside_image_rkp += 1,
                KeypointStatus::OutsideDepth => self.debug_info.nr_outside_depth_rkp += 1,
            }
        }
    }

    /// Median-disparity keyframe gate: `LowDisparity` means the scene barely
    /// moved and callers may skip the keyframe or loop check.
    pub fn check_median_disparity(
        &self,
        ref_frame: &Frame,
        cur_frame: &Frame,
    ) -> (TrackingStatus, f64) {
        let median = compute_median_disparity(ref_frame, cur_frame);
        if median < self.params.disparity_threshold_px {
            debug!(median, "low median disparity");
            (TrackingStatus::LowDisparity, median)
        } else {
            (TrackingStatus::Valid, median)
        }
    }

    /// Headless diagnostic render: matched keypoint pairs for display or
    /// logging. No tracking-state effect.
    pub fn display_frame(
        &self,
        ref_frame: &Frame,
        cur_frame: &Frame,
    ) -> Vec<(KeypointCv, KeypointCv)> {
        let matches = find_matching_keypoints(ref_frame, cur_frame);
        let pairs: Vec<(KeypointCv, KeypointCv)> = matches
            .iter()
            .map(|&(r, c)| (ref_frame.keypoints[r], cur_frame.keypoints[c]))
            .collect();
        debug!(
            ref_frame = ref_frame.id,
            cur_frame = cur_frame.id,
            pairs = pairs.len(),
            "display frame"
        );
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Unit};
    use rand::prelude::*;

    use crate::frontend::camera::CameraParams;

    fn test_camera() -> StereoCamera {
        StereoCamera {
            left: CameraParams {
                fx: 450.0,
                fy: 450.0,
                cx: 376.0,
                cy: 240.0,
                width: 752,
                height: 480,
            },
            baseline: 0.11,
        }
    }

    /// Deterministic grid detector: corners every 40px in free cells.
    struct GridDetector;

    impl CornerDetector for GridDetector {
        fn detect(
            &self,
            _frame: &Frame,
            mask: &CameraMask,
            need_n_corners: usize,
        ) -> (KeypointsCv, Vec<f64>) {
            let mut corners = Vec::new();
            let mut y = 20.0;
            while y < 480.0 && corners.len() < need_n_corners {
                let mut x = 20.0;
                while x < 752.0 && corners.len() < need_n_corners {
                    let kp = Point2::new(x, y);
                    if mask.is_free(&kp) {
                        corners.push(kp);
                    }
                    x += 40.0;
                }
                y += 40.0;
            }
            let scores = vec![1.0; corners.len()];
            (corners, scores)
        }
    }

    /// Accepts every prediction unchanged.
    struct PassthroughRefiner;

    impl FlowRefiner for PassthroughRefiner {
        fn refine(&self, _ref_frame: &Frame, predicted: &KeypointsCv) -> Vec<Option<KeypointCv>> {
            predicted.iter().map(|kp| Some(*kp)).collect()
        }
    }

    /// Loses every n-th correspondence.
    struct LossyRefiner(usize);

    impl FlowRefiner for LossyRefiner {
        fn refine(&self, _ref_frame: &Frame, predicted: &KeypointsCv) -> Vec<Option<KeypointCv>> {
            predicted
                .iter()
                .enumerate()
                .map(|(i, kp)| if i % self.0 == 0 { None } else { Some(*kp) })
                .collect()
        }
    }

    fn make_tracker(params: TrackerParams) -> Tracker {
        Tracker::new(
            params,
            test_camera(),
            Box::new(GridDetector),
            Box::new(PassthroughRefiner),
        )
        .unwrap()
    }

    fn frame_with_spread_keypoints(n: usize) -> Frame {
        let cam = test_camera().left;
        let mut rng = StdRng::seed_from_u64(42);
        let mut frame = Frame::new(0, 0);
        for i in 0..n {
            let kp = Point2::new(rng.gen_range(20.0..730.0), rng.gen_range(20.0..460.0));
            frame.push_keypoint(kp, Some(i as LandmarkId), 1, &cam);
        }
        frame
    }

    /// Stereo pair where `keypoints_3d` of the current frame are the
    /// reference points seen through the inverse of `ref_pose_cur`.
    fn stereo_pair_with_transform(n: usize, ref_pose_cur: &SE3) -> (StereoFrame, StereoFrame) {
        let cam = test_camera().left;
        let mut rng = StdRng::seed_from_u64(9);

        let mut ref_left = Frame::new(0, 0);
        let mut cur_left = Frame::new(1, 0);
        let mut points_ref = Vec::new();
        for i in 0..n {
            let p = Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(3.0..10.0),
            );
            points_ref.push(p);
            let kp = cam.project(&p).unwrap_or(Point2::new(376.0, 240.0));
            ref_left.push_keypoint(kp, Some(i as LandmarkId), 1, &cam);
            cur_left.push_keypoint(kp, Some(i as LandmarkId), 2, &cam);
        }

        let cur_pose_ref = ref_pose_cur.inverse();
        let mut ref_stereo = StereoFrame::new(ref_left, Frame::new(0, 0));
        let mut cur_stereo = StereoFrame::new(cur_left, Frame::new(1, 0));
        for (i, p) in points_ref.iter().enumerate() {
            ref_stereo.keypoints_3d[i] = *p;
            ref_stereo.right_keypoints_status[i] = KeypointStatus::Valid;
            ref_stereo.keypoints_depth[i] = p.z;
            let p_cur = cur_pose_ref.transform_point(p);
            cur_stereo.keypoints_3d[i] = p_cur;
            cur_stereo.right_keypoints_status[i] = KeypointStatus::Valid;
            cur_stereo.keypoints_depth[i] = p_cur.z;
        }
        (ref_stereo, cur_stereo)
    }

    #[test]
    fn test_params_validation() {
        let mut params = TrackerParams::default();
        params.ransac_probability = 1.5;
        assert!(params.validate().is_err());

        params = TrackerParams::default();
        params.max_features = 0;
        assert!(params.validate().is_err());

        assert!(TrackerParams::default().validate().is_ok());
    }

    #[test]
    fn test_feature_detection_assigns_fresh_monotone_ids() {
        let mut tracker = make_tracker(TrackerParams {
            max_features: 20,
            ..Default::default()
        });

        let mut frame_a = Frame::new(0, 0);
        tracker.feature_detection(&mut frame_a);
        assert!(frame_a.num_features() > 0);
        assert!(frame_a.num_features() <= 20);
        let max_id_a = frame_a.landmarks.iter().flatten().max().copied().unwrap();

        let mut frame_b = Frame::new(1, 0);
        tracker.feature_detection(&mut frame_b);
        let min_id_b = frame_b.landmarks.iter().flatten().min().copied().unwrap();

        // Ids are never reused across detections.
        assert!(min_id_b > max_id_a);
        assert_eq!(tracker.landmark_count(), (frame_a.num_features() + frame_b.num_features()) as LandmarkId);
    }

    #[test]
    fn test_feature_detection_skips_occupied_cells() {
        let mut tracker = make_tracker(TrackerParams {
            max_features: 50,
            min_distance: 30.0,
            ..Default::default()
        });

        let cam = test_camera().left;
        let mut frame = Frame::new(0, 0);
        frame.push_keypoint(Point2::new(20.0, 20.0), Some(99), 1, &cam);

        tracker.feature_detection(&mut frame);
        // The pre-existing feature's neighbourhood must stay single-occupant.
        let near = frame
            .keypoints
            .iter()
            .filter(|kp| (kp.x - 20.0).abs() < 30.0 && (kp.y - 20.0).abs() < 30.0)
            .count();
        assert_eq!(near, 1);
    }

    #[test]
    fn test_feature_tracking_drops_lost_correspondences() {
        let mut tracker = Tracker::new(
            TrackerParams::default(),
            test_camera(),
            Box::new(GridDetector),
            Box::new(LossyRefiner(3)),
        )
        .unwrap();

        let ref_frame = frame_with_spread_keypoints(12);
        let mut cur_frame = Frame::new(1, 1);
        tracker.feature_tracking(&ref_frame, &mut cur_frame);

        // Every third correspondence lost: 12 - 4 survive.
        assert_eq!(cur_frame.num_features(), 8);
        // Ages incremented on the survivors.
        assert!(cur_frame.landmarks_age.iter().all(|&a| a == 2));
        // Lost landmark 0 must not appear.
        assert!(!cur_frame.landmarks.contains(&Some(0)));
    }

    #[test]
    fn test_feature_tracking_retires_old_features() {
        let mut tracker = make_tracker(TrackerParams {
            max_age: 5,
            ..Default::default()
        });

        let cam = test_camera().left;
        let mut ref_frame = Frame::new(0, 0);
        ref_frame.push_keypoint(Point2::new(100.0, 100.0), Some(0), 5, &cam);
        ref_frame.push_keypoint(Point2::new(200.0, 100.0), Some(1), 2, &cam);

        let mut cur_frame = Frame::new(1, 1);
        tracker.feature_tracking(&ref_frame, &mut cur_frame);
        assert_eq!(cur_frame.landmarks, vec![Some(1)]);
    }

    #[test]
    fn test_disabled_tracking_short_circuits() {
        let mut tracker = make_tracker(TrackerParams {
            tracking_enabled: false,
            ..Default::default()
        });

        let mut ref_frame = frame_with_spread_keypoints(20);
        let mut cur_frame = ref_frame.clone();
        let (status, pose) =
            tracker.geometric_outlier_rejection_mono(&mut ref_frame, &mut cur_frame);
        assert_eq!(status, TrackingStatus::Disabled);
        assert!(pose.rotation_angle() < 1e-12);

        let identity = SE3::identity();
        let (mut ref_stereo, mut cur_stereo) = stereo_pair_with_transform(20, &identity);
        let (status, _) =
            tracker.geometric_outlier_rejection_stereo(&mut ref_stereo, &mut cur_stereo);
        assert_eq!(status, TrackingStatus::Disabled);
    }

    #[test]
    fn test_mono_rejection_zero_motion_is_valid_identity() {
        let mut tracker = make_tracker(TrackerParams::default());

        let mut ref_frame = frame_with_spread_keypoints(30);
        let mut cur_frame = ref_frame.clone();
        cur_frame.id = 1;

        let (status, pose) =
            tracker.geometric_outlier_rejection_mono(&mut ref_frame, &mut cur_frame);

        assert_eq!(status, TrackingStatus::Valid);
        assert!(pose.rotation_angle() < 1e-6);
        assert_relative_eq!(pose.translation.norm(), 0.0, epsilon = 1e-9);
        // All matches inlier: no landmark was unassigned.
        assert_eq!(ref_frame.num_tracked(), 30);
        assert_eq!(cur_frame.num_tracked(), 30);
        assert_eq!(tracker.debug_info.nr_mono_inliers, 30);
    }

    #[test]
    fn test_mono_rejection_too_few_matches() {
        let mut tracker = make_tracker(TrackerParams::default());
        let mut ref_frame = frame_with_spread_keypoints(4);
        let mut cur_frame = ref_frame.clone();

        let (status, pose) =
            tracker.geometric_outlier_rejection_mono(&mut ref_frame, &mut cur_frame);
        assert_eq!(status, TrackingStatus::FewMatches);
        assert!(pose.rotation_angle() < 1e-12);
    }

    #[test]
    fn test_stereo_rejection_recovers_known_transform() {
        let mut tracker = make_tracker(TrackerParams::default());

        let ref_pose_cur = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Unit::new_normalize(Vector3::new(0.1, 1.0, 0.2)),
                0.2,
            ),
            translation: Vector3::new(0.5, -0.1, 0.3),
        };
        let (mut ref_stereo, mut cur_stereo) = stereo_pair_with_transform(40, &ref_pose_cur);

        let (status, pose) =
            tracker.geometric_outlier_rejection_stereo(&mut ref_stereo, &mut cur_stereo);

        assert_eq!(status, TrackingStatus::Valid);
        let rot_err = pose.rotation.inverse() * ref_pose_cur.rotation;
        assert!(rot_err.angle() < 1e-6);
        assert_relative_eq!(pose.translation, ref_pose_cur.translation, epsilon = 1e-6);
        assert_eq!(tracker.debug_info.nr_stereo_inliers, 40);
        // No outlier removal on a clean set.
        assert_eq!(ref_stereo.left_frame.num_tracked(), 40);
    }

    #[test]
    fn test_stereo_rejection_excludes_injected_mismatches() {
        let mut tracker = make_tracker(TrackerParams::default());

        let ref_pose_cur = SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::y()), 0.15),
            translation: Vector3::new(0.4, 0.0, 0.2),
        };
        let (mut ref_stereo, mut cur_stereo) = stereo_pair_with_transform(40, &ref_pose_cur);

        // Corrupt 30% of the current-frame points.
        let mut rng = StdRng::seed_from_u64(5);
        let corrupted: Vec<usize> = (0..12).map(|i| i * 3).collect();
        for &i in &corrupted {
            cur_stereo.keypoints_3d[i] += Vector3::new(
                rng.gen_range(1.0..2.0),
                rng.gen_range(1.0..2.0),
                rng.gen_range(1.0..2.0),
            );
        }

        let (status, pose) =
            tracker.geometric_outlier_rejection_stereo(&mut ref_stereo, &mut cur_stereo);

        assert_eq!(status, TrackingStatus::Valid);
        assert_relative_eq!(pose.translation, ref_pose_cur.translation, epsilon = 1e-6);
        // Injected mismatches were unassigned in both frames.
        for &i in &corrupted {
            assert_eq!(cur_stereo.left_frame.landmarks[i], None);
            assert_eq!(ref_stereo.left_frame.landmarks[i], None);
        }
    }

    #[test]
    fn test_stereo_given_rotation_returns_covariance() {
        let mut tracker = make_tracker(TrackerParams::default());

        let rotation =
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::x()), 0.05);
        let ref_pose_cur = SE3 {
            rotation,
            translation: Vector3::new(0.2, 0.1, -0.05),
        };
        let (mut ref_stereo, mut cur_stereo) = stereo_pair_with_transform(30, &ref_pose_cur);

        let ((status, pose), covariance) = tracker
            .geometric_outlier_rejection_stereo_given_rotation(
                &mut ref_stereo,
                &mut cur_stereo,
                &rotation,
            );

        assert_eq!(status, TrackingStatus::Valid);
        assert_relative_eq!(pose.translation, ref_pose_cur.translation, epsilon = 1e-6);
        // Covariance is symmetric and positive on the diagonal.
        assert_relative_eq!(covariance, covariance.transpose(), epsilon = 1e-12);
        for i in 0..3 {
            assert!(covariance[(i, i)] > 0.0);
        }
    }

    #[test]
    fn test_remove_outliers_mono_is_idempotent() {
        let mut ref_frame = frame_with_spread_keypoints(10);
        let mut cur_frame = ref_frame.clone();
        let matches = find_matching_keypoints(&ref_frame, &cur_frame);
        let inliers = vec![0, 2, 4, 6, 8];

        Tracker::remove_outliers_mono(&mut ref_frame, &mut cur_frame, &matches, &inliers);
        let after_once = (ref_frame.landmarks.clone(), cur_frame.landmarks.clone());

        Tracker::remove_outliers_mono(&mut ref_frame, &mut cur_frame, &matches, &inliers);
        assert_eq!(ref_frame.landmarks, after_once.0);
        assert_eq!(cur_frame.landmarks, after_once.1);
        assert_eq!(ref_frame.num_tracked(), 5);
    }

    #[test]
    fn test_check_status_right_keypoints_counts() {
        let mut tracker = make_tracker(TrackerParams::default());
        let statuses = vec![
            KeypointStatus::Valid,
            KeypointStatus::Valid,
            KeypointStatus::NotFound,
            KeypointStatus::OutsideImage,
            KeypointStatus::OutsideDepth,
            KeypointStatus::OutsideDepth,
        ];
        tracker.check_status_right_keypoints(&statuses);
        assert_eq!(tracker.debug_info.nr_valid_rkp, 2);
        assert_eq!(tracker.debug_info.nr_not_found_rkp, 1);
        assert_eq!(tracker.debug_info.nr_outside_image_rkp, 1);
        assert_eq!(tracker.debug_info.nr_outside_depth_rkp, 2);
    }

    #[test]
    fn test_median_disparity_gate() {
        let tracker = make_tracker(TrackerParams {
            disparity_threshold_px: 2.0,
            ..Default::default()
        });

        let ref_frame = frame_with_spread_keypoints(10);
        let (status, median) = tracker.check_median_disparity(&ref_frame, &ref_frame);
        assert_eq!(status, TrackingStatus::LowDisparity);
        assert_relative_eq!(median, 0.0);

        let cam = test_camera().left;
        let mut cur_frame = Frame::new(1, 1);
        for (i, kp) in ref_frame.keypoints.iter().enumerate() {
            cur_frame.push_keypoint(
                Point2::new(kp.x + 5.0, kp.y),
                ref_frame.landmarks[i],
                2,
                &cam,
            );
        }
        let (status, median) = tracker.check_median_disparity(&ref_frame, &cur_frame);
        assert_eq!(status, TrackingStatus::Valid);
        assert_relative_eq!(median, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_display_frame_returns_matched_pairs() {
        let tracker = make_tracker(TrackerParams::default());
        let ref_frame = frame_with_spread_keypoints(6);
        let mut cur_frame = ref_frame.clone();
        cur_frame.landmarks[3] = None;

        let pairs = tracker.display_frame(&ref_frame, &cur_frame);
        assert_eq!(pairs.len(), 5);
        assert_eq!(pairs[0].0, pairs[0].1);
    }
}
