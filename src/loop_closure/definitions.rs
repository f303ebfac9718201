//! Data model for loop-closure detection: keyframe snapshots, match
//! islands, detection outcomes, and the pose-graph factor types handed to
//! the optimizer.

use nalgebra::{DMatrix, SVector, Vector3};

use crate::frontend::frame::{FrameId, KeypointsCv, Timestamp};
use crate::geometry::SE3;

/// 256-bit binary feature descriptor.
pub type OrbDescriptor = Vec<u8>;

/// Hamming distance between two binary descriptors.
pub fn descriptor_distance(a: &[u8], b: &[u8]) -> u32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Terminal state of one loop-closure query. Exactly one success terminal;
/// every other value is a rejection stage, ordered as the detector applies
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LCDStatus {
    LoopDetected,
    /// No database candidates at all (after excluding recent frames).
    NoMatches,
    /// Normalized similarity score of the query itself too low to trust.
    LowNssFactor,
    /// All candidate scores below the alpha threshold.
    LowScore,
    /// No candidate group survived island grouping.
    NoGroups,
    /// Best island not temporally consistent with recent queries.
    FailedTemporalConstraint,
    /// Too few descriptor correspondences or mono RANSAC failed.
    FailedGeomVerification,
    /// 3D-3D pose recovery failed on the verified match.
    FailedPoseRecovery,
}

impl LCDStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LCDStatus::LoopDetected => "LOOP_DETECTED",
            LCDStatus::NoMatches => "NO_MATCHES",
            LCDStatus::LowNssFactor => "LOW_NSS_FACTOR",
            LCDStatus::LowScore => "LOW_SCORE",
            LCDStatus::NoGroups => "NO_GROUPS",
            LCDStatus::FailedTemporalConstraint => "FAILED_TEMPORAL_CONSTRAINT",
            LCDStatus::FailedGeomVerification => "FAILED_GEOM_VERIFICATION",
            LCDStatus::FailedPoseRecovery => "FAILED_POSE_RECOVERY",
        }
    }
}

/// How candidate matches are geometrically verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GeomVerifOption {
    /// Mono RANSAC over bearing vectors.
    Nister,
    /// Trust the descriptor matching without a geometric check.
    None,
}

/// How the relative pose of a verified loop is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PoseRecoveryOption {
    /// Full 3D-3D Arun RANSAC.
    RansacArun,
    /// Keep the verified rotation, solve translation only.
    GivenRot,
}

/// Immutable keyframe snapshot stored in the loop-closure database.
#[derive(Debug, Clone)]
pub struct LcdFrame {
    pub timestamp: Timestamp,
    /// Database id, assigned on insertion.
    pub id: FrameId,
    /// Originating keyframe id in the frontend sequence.
    pub id_kf: FrameId,
    pub keypoints: KeypointsCv,
    /// 3D position per keypoint in the keyframe's camera frame.
    pub keypoints_3d: Vec<Vector3<f64>>,
    pub descriptors_vec: Vec<OrbDescriptor>,
    /// Row-per-descriptor packing of `descriptors_vec`.
    pub descriptors_mat: DMatrix<u8>,
    /// Unit bearing vector per keypoint.
    pub versors: Vec<Vector3<f64>>,
}

impl LcdFrame {
    pub fn new(
        timestamp: Timestamp,
        id_kf: FrameId,
        keypoints: KeypointsCv,
        keypoints_3d: Vec<Vector3<f64>>,
        descriptors_vec: Vec<OrbDescriptor>,
        versors: Vec<Vector3<f64>>,
    ) -> Self {
        let rows = descriptors_vec.len();
        let cols = descriptors_vec.first().map_or(0, |d| d.len());
        let descriptors_mat = DMatrix::from_fn(rows, cols, |r, c| descriptors_vec[r][c]);
        Self {
            timestamp,
            id: 0,
            id_kf,
            keypoints,
            keypoints_3d,
            descriptors_vec,
            descriptors_mat,
            versors,
        }
    }
}

/// A contiguous run of database ids matched against one query, with its
/// aggregate score and best member.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchIsland {
    pub start_id: FrameId,
    pub end_id: FrameId,
    /// Sum of member scores.
    pub island_score: f64,
    pub best_id: FrameId,
    pub best_score: f64,
}

impl MatchIsland {
    pub fn new(start_id: FrameId, end_id: FrameId) -> Self {
        debug_assert!(start_id <= end_id);
        Self {
            start_id,
            end_id,
            island_score: 0.0,
            best_id: start_id,
            best_score: 0.0,
        }
    }

    /// Number of ids spanned by the island.
    pub fn size(&self) -> u64 {
        self.end_id - self.start_id + 1
    }
}

impl PartialOrd for MatchIsland {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.island_score.partial_cmp(&other.island_score)
    }
}

/// Outcome of one loop-closure query against the database.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub status: LCDStatus,
    pub query_id: FrameId,
    pub match_id: FrameId,
    /// `match_Pose_query`; meaningful only when `is_loop()`.
    pub relative_pose: SE3,
}

impl LoopResult {
    pub fn rejected(status: LCDStatus, query_id: FrameId) -> Self {
        debug_assert_ne!(status, LCDStatus::LoopDetected);
        Self {
            status,
            query_id,
            match_id: 0,
            relative_pose: SE3::identity(),
        }
    }

    /// True iff the query terminated in the single success state.
    pub fn is_loop(&self) -> bool {
        self.status == LCDStatus::LoopDetected
    }
}

/// Per-query diagnostic counters, overwritten by each detection.
#[derive(Debug, Clone, Default)]
pub struct LcdDebugInfo {
    pub mono_input_size: usize,
    pub mono_inliers: usize,
    pub mono_iters: usize,
    pub stereo_input_size: usize,
    pub stereo_inliers: usize,
    pub stereo_iters: usize,
    pub pgo_size: usize,
    pub pgo_lc_count: usize,
}

/// Diagonal noise sigmas on an SE3 factor (rotation xyz, translation xyz).
#[derive(Debug, Clone, Copy)]
pub struct NoiseModel {
    pub sigmas: SVector<f64, 6>,
}

impl NoiseModel {
    pub fn isotropic(sigma: f64) -> Self {
        Self {
            sigmas: SVector::repeat(sigma),
        }
    }
}

/// Between-keyframe odometry constraint carrying the frontend's world pose
/// of the current keyframe.
#[derive(Debug, Clone)]
pub struct OdometryFactor {
    pub cur_key: FrameId,
    pub w_pose_blkf: SE3,
    pub noise: NoiseModel,
}

/// Loop-closure constraint between two keyframes.
#[derive(Debug, Clone)]
pub struct LoopClosureFactor {
    pub ref_key: FrameId,
    pub cur_key: FrameId,
    /// Transform from the current keyframe into the reference keyframe.
    pub ref_pose_cur: SE3,
    pub noise: NoiseModel,
}

/// Factor stream entry handed to the pose-graph optimizer.
#[derive(Debug, Clone)]
pub enum PoseGraphFactor {
    Odometry(OdometryFactor),
    LoopClosure(LoopClosureFactor),
}

/// One keyframe's worth of input to the loop-closure worker.
#[derive(Debug, Clone)]
pub struct LcdInput {
    pub timestamp: Timestamp,
    pub cur_kf_id: FrameId,
    pub frame: LcdFrame,
    /// Frontend odometry estimate of this keyframe in the world frame.
    pub w_pose_blkf: SE3,
    /// Similarity score per database frame id (external scoring stage).
    pub match_scores: Vec<(FrameId, f64)>,
    /// Normalized similarity of the query against its own recent past.
    pub nss_factor: f64,
}

/// Result bundle published after each keyframe.
#[derive(Debug, Clone)]
pub struct LcdOutput {
    pub is_loop: bool,
    pub timestamp_query: Timestamp,
    pub timestamp_match: Timestamp,
    pub id_query: FrameId,
    pub id_match: FrameId,
    pub relative_pose: SE3,
    /// Current odometry values, one per registered keyframe.
    pub states: Vec<(FrameId, SE3)>,
    /// Full factor stream accumulated so far.
    pub factors: Vec<PoseGraphFactor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_distance_hamming() {
        let a = vec![0b1010_1010u8, 0xFF];
        let b = vec![0b0101_0101u8, 0xFF];
        assert_eq!(descriptor_distance(&a, &b), 8);
        assert_eq!(descriptor_distance(&a, &a), 0);
    }

    #[test]
    fn test_island_size_invariant() {
        let island = MatchIsland::new(4, 9);
        assert_eq!(island.size(), 6);
        let single = MatchIsland::new(7, 7);
        assert_eq!(single.size(), 1);
    }

    #[test]
    fn test_island_ordering_by_score() {
        let mut a = MatchIsland::new(0, 2);
        a.island_score = 1.0;
        let mut b = MatchIsland::new(5, 6);
        b.island_score = 2.0;
        let mut c = MatchIsland::new(9, 9);
        c.island_score = 2.0;

        assert!(a < b);
        assert!(b > a);
        // Equal scores compare equal-order (neither < nor >).
        assert!(!(b < c) && !(b > c));

        let mut islands = vec![b.clone(), a.clone(), c.clone()];
        islands.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(islands[0], a);
    }

    #[test]
    fn test_is_loop_only_for_success_terminal() {
        let statuses = [
            LCDStatus::NoMatches,
            LCDStatus::LowNssFactor,
            LCDStatus::LowScore,
            LCDStatus::NoGroups,
            LCDStatus::FailedTemporalConstraint,
            LCDStatus::FailedGeomVerification,
            LCDStatus::FailedPoseRecovery,
        ];
        for status in statuses {
            assert!(!LoopResult::rejected(status, 3).is_loop());
        }

        let detected = LoopResult {
            status: LCDStatus::LoopDetected,
            query_id: 10,
            match_id: 2,
            relative_pose: SE3::identity(),
        };
        assert!(detected.is_loop());
    }

    #[test]
    fn test_lcd_frame_packs_descriptor_matrix() {
        let descriptors = vec![vec![1u8, 2, 3], vec![4u8, 5, 6]];
        let frame = LcdFrame::new(0, 0, vec![], vec![], descriptors, vec![]);
        assert_eq!(frame.descriptors_mat.nrows(), 2);
        assert_eq!(frame.descriptors_mat.ncols(), 3);
        assert_eq!(frame.descriptors_mat[(1, 0)], 4);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(LCDStatus::LoopDetected.as_str(), "LOOP_DETECTED");
        assert_eq!(LCDStatus::NoMatches.as_str(), "NO_MATCHES");
    }
}
