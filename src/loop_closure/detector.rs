//! Loop-closure detection over externally scored keyframe candidates.
//!
//! The detector never raises an error for a rejected candidate: every query
//! terminates in exactly one `LCDStatus`, and only `LoopDetected` carries a
//! meaningful relative pose. Rejection stages run in a fixed order so a
//! status value also identifies how far the candidate got.

use std::sync::Arc;

use anyhow::{bail, Result};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::frontend::frame::FrameId;
use crate::frontend::ransac::{
    ransac_alignment_arun, ransac_relative_pose_mono, ransac_translation_given_rotation_stereo,
    MonoRansacConfig, RansacPoseResult, StereoRansacConfig,
};
use crate::geometry::SE3;
use crate::loop_closure::db::LcdFrameDatabase;
use crate::loop_closure::definitions::{
    descriptor_distance, GeomVerifOption, LCDStatus, LcdDebugInfo, LcdFrame, LcdInput, LcdOutput,
    LoopClosureFactor, LoopResult, MatchIsland, NoiseModel, OdometryFactor, PoseGraphFactor,
    PoseRecoveryOption,
};

/// Loop-closure detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcdParams {
    /// Candidate scores below `alpha * nss_factor` are discarded.
    pub alpha: f64,
    /// Queries with a normalized similarity score below this are skipped.
    pub min_nss_factor: f64,
    /// Islands with fewer members are discarded.
    pub min_matches_per_group: usize,
    /// Maximum id gap inside one island.
    pub max_intraisland_gap: u64,
    /// Maximum id gap between consecutive matched islands.
    pub max_nrframes_between_islands: u64,
    /// Maximum query-id gap for the temporal-consistency chain.
    pub max_nrframes_between_queries: u64,
    /// Consecutive consistent queries required before accepting a loop.
    pub min_temporal_matches: usize,
    /// Database frames closer than this to the query are never candidates.
    pub dist_local: u64,
    pub geom_check: GeomVerifOption,
    pub pose_recovery: PoseRecoveryOption,
    /// Lowe ratio for descriptor matching (best < ratio * second-best).
    pub lowe_ratio: f64,
    /// Minimum mutual descriptor correspondences for verification.
    pub min_correspondences: usize,
    pub ransac_max_iterations: usize,
    pub ransac_probability: f64,
    /// Mono verification inlier threshold (angular units).
    pub mono_threshold: f64,
    pub min_mono_inliers: usize,
    /// 3D-3D pose-recovery inlier threshold in meters.
    pub stereo_threshold_m: f64,
    pub min_stereo_inliers: usize,
    pub odometry_noise_sigma: f64,
    pub loop_closure_noise_sigma: f64,
}

impl Default for LcdParams {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            min_nss_factor: 0.005,
            min_matches_per_group: 1,
            max_intraisland_gap: 3,
            max_nrframes_between_islands: 3,
            max_nrframes_between_queries: 2,
            min_temporal_matches: 3,
            dist_local: 20,
            geom_check: GeomVerifOption::Nister,
            pose_recovery: PoseRecoveryOption::RansacArun,
            lowe_ratio: 0.7,
            min_correspondences: 12,
            ransac_max_iterations: 300,
            ransac_probability: 0.99,
            mono_threshold: 1e-3,
            min_mono_inliers: 10,
            stereo_threshold_m: 0.15,
            min_stereo_inliers: 6,
            odometry_noise_sigma: 0.1,
            loop_closure_noise_sigma: 0.5,
        }
    }
}

impl LcdParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.lowe_ratio > 0.0 && self.lowe_ratio <= 1.0) {
            bail!("lowe_ratio must lie in (0, 1], got {}", self.lowe_ratio);
        }
        if !(self.ransac_probability > 0.0 && self.ransac_probability < 1.0) {
            bail!("ransac_probability must lie in (0, 1)");
        }
        if self.min_temporal_matches == 0 {
            bail!("min_temporal_matches must be at least 1");
        }
        Ok(())
    }
}

/// `(query_index, match_index)` descriptor correspondences.
type DescriptorMatches = Vec<(usize, usize)>;

pub struct LoopClosureDetector {
    params: LcdParams,
    db: Arc<LcdFrameDatabase>,
    /// Island matched by the most recent non-trivially-rejected query.
    latest_matched_island: Option<MatchIsland>,
    latest_query_id: FrameId,
    /// Length of the current chain of temporally consistent queries.
    temporal_entries: usize,
    /// Odometry trajectory: world pose per registered keyframe.
    odom_values: Vec<(FrameId, SE3)>,
    factors: Vec<PoseGraphFactor>,
    pub debug_info: LcdDebugInfo,
}

impl LoopClosureDetector {
    pub fn new(params: LcdParams, db: Arc<LcdFrameDatabase>) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            db,
            latest_matched_island: None,
            latest_query_id: 0,
            temporal_entries: 0,
            odom_values: Vec::new(),
            factors: Vec::new(),
            debug_info: LcdDebugInfo::default(),
        })
    }

    pub fn params(&self) -> &LcdParams {
        &self.params
    }

    pub fn database(&self) -> &Arc<LcdFrameDatabase> {
        &self.db
    }

    /// Group scored candidates into maximal contiguous islands.
    ///
    /// Candidates are grouped into runs where consecutive ids differ by at
    /// most `max_intraisland_gap`; an island's score is the sum of member
    /// scores and its best member is tracked. Islands with fewer than
    /// `min_matches_per_group` members are dropped.
    pub fn compute_islands(&self, scores: &[(FrameId, f64)]) -> Vec<MatchIsland> {
        if scores.is_empty() {
            return Vec::new();
        }
        let mut sorted: Vec<(FrameId, f64)> = scores.to_vec();
        sorted.sort_by_key(|&(id, _)| id);

        let mut islands = Vec::new();
        let mut members = 1usize;
        let (first_id, first_score) = sorted[0];
        let mut island = MatchIsland {
            start_id: first_id,
            end_id: first_id,
            island_score: first_score,
            best_id: first_id,
            best_score: first_score,
        };

        for &(id, score) in &sorted[1..] {
            if id - island.end_id <= self.params.max_intraisland_gap {
                island.end_id = id;
                island.island_score += score;
                members += 1;
                if score > island.best_score {
                    island.best_score = score;
                    island.best_id = id;
                }
            } else {
                if members >= self.params.min_matches_per_group {
                    islands.push(island.clone());
                }
                members = 1;
                island = MatchIsland {
                    start_id: id,
                    end_id: id,
                    island_score: score,
                    best_id: id,
                    best_score: score,
                };
            }
        }
        if members >= self.params.min_matches_per_group {
            islands.push(island);
        }
        islands
    }

    /// Whether `island` continues the chain of consistent matches. Updates
    /// the chain state either way.
    fn check_temporal_constraint(&mut self, query_id: FrameId, island: &MatchIsland) -> bool {
        let consistent = match &self.latest_matched_island {
            Some(prev) => {
                let query_gap = query_id.saturating_sub(self.latest_query_id);
                let island_gap = if island.start_id > prev.end_id {
                    island.start_id - prev.end_id
                } else if prev.start_id > island.end_id {
                    prev.start_id - island.end_id
                } else {
                    0
                };
                query_gap <= self.params.max_nrframes_between_queries
                    && island_gap <= self.params.max_nrframes_between_islands
            }
            None => false,
        };

        if consistent {
            self.temporal_entries += 1;
        } else {
            self.temporal_entries = 1;
        }
        self.latest_matched_island = Some(island.clone());
        self.latest_query_id = query_id;

        self.temporal_entries >= self.params.min_temporal_matches
    }

    /// Mutual nearest-neighbour Hamming matching with Lowe's ratio test.
    fn match_descriptors(&self, query: &LcdFrame, candidate: &LcdFrame) -> DescriptorMatches {
        let nearest_two = |desc: &[u8], pool: &[Vec<u8>]| -> (usize, u32, u32) {
            let mut best_idx = 0usize;
            let mut best = u32::MAX;
            let mut second = u32::MAX;
            for (j, other) in pool.iter().enumerate() {
                let dist = descriptor_distance(desc, other);
                if dist < best {
                    second = best;
                    best = dist;
                    best_idx = j;
                } else if dist < second {
                    second = dist;
                }
            }
            (best_idx, best, second)
        };

        let mut matches = Vec::new();
        for (i, desc) in query.descriptors_vec.iter().enumerate() {
            if candidate.descriptors_vec.is_empty() {
                break;
            }
            let (j, best, second) = nearest_two(desc, &candidate.descriptors_vec);
            if (best as f64) >= self.params.lowe_ratio * second as f64 {
                continue;
            }
            // Mutual check: the candidate feature must pick i back.
            let (back, _, _) = nearest_two(&candidate.descriptors_vec[j], &query.descriptors_vec);
            if back == i {
                matches.push((i, j));
            }
        }
        matches
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

    /// Geometric verification of a candidate: descriptor matching, then
    /// (optionally) mono RANSAC over the matched bearing vectors. On success
    /// returns the verification pose estimate (`match_Pose_query`, direction
    /// only) and the surviving correspondences.
    fn geometric_verification(
        &mut self,
        query: &LcdFrame,
        candidate: &LcdFrame,
    ) -> Option<(RansacPoseResult, DescriptorMatches)> {
        let matches = self.match_descriptors(query, candidate);
        if matches.len() < self.params.min_correspondences {
            debug!(
                correspondences = matches.len(),
                required = self.params.min_correspondences,
                "verification: too few descriptor matches"
            );
            return None;
        }
        self.debug_info.mono_input_size = matches.len();

        match self.params.geom_check {
            GeomVerifOption::None => {
                let all_inliers = (0..matches.len()).collect();
                Some((
                    RansacPoseResult {
                        pose: SE3::identity(),
                        inliers: all_inliers,
                        iterations: 0,
                    },
                    matches,
                ))
            }
            GeomVerifOption::Nister => {
                let f_match: Vec<_> = matches.iter().map(|&(_, j)| candidate.versors[j]).collect();
                let f_query: Vec<_> = matches.iter().map(|&(i, _)| query.versors[i]).collect();

                let result =
                    ransac_relative_pose_mono(&f_match, &f_query, &self.mono_config())?;
                self.debug_info.mono_inliers = result.inliers.len();
                self.debug_info.mono_iters = result.iterations;

                let surviving: DescriptorMatches =
                    result.inliers.iter().map(|&k| matches[k]).collect();
                Some((result, surviving))
            }
        }
    }

    /// Recover the metric relative pose `match_Pose_query` from the verified
    /// 3D-3D correspondences.
    fn recover_pose(
        &mut self,
        query: &LcdFrame,
        candidate: &LcdFrame,
        verification: &RansacPoseResult,
        matches: &DescriptorMatches,
    ) -> Option<SE3> {
        let points_match: Vec<_> = matches
            .iter()
            .map(|&(_, j)| candidate.keypoints_3d[j])
            .collect();
        let points_query: Vec<_> = matches.iter().map(|&(i, _)| query.keypoints_3d[i]).collect();
        self.debug_info.stereo_input_size = points_match.len();

        match self.params.pose_recovery {
            PoseRecoveryOption::RansacArun => {
                let result =
                    ransac_alignment_arun(&points_match, &points_query, &self.stereo_config())?;
                self.debug_info.stereo_inliers = result.inliers.len();
                self.debug_info.stereo_iters = result.iterations;
                Some(result.pose)
            }
            PoseRecoveryOption::GivenRot => {
                // Unit covariances: no per-point uncertainty available here.
                let covs = vec![Matrix3::identity(); points_match.len()];
                let result = ransac_translation_given_rotation_stereo(
                    &points_match,
                    &points_query,
                    &covs,
                    &covs,
                    &verification.pose.rotation,
                    &self.stereo_config(),
                )?;
                self.debug_info.stereo_inliers = result.inliers.len();
                self.debug_info.stereo_iters = result.iterations;
                Some(SE3 {
                    rotation: verification.pose.rotation,
                    translation: result.translation,
                })
            }
        }
    }

    /// Run the full loop-closure decision chain for one query.
    ///
    /// The rejection stages apply in order: no candidates, low query
    /// self-similarity, all scores below threshold, no surviving island,
    /// temporal inconsistency, geometric-verification failure, pose-recovery
    /// failure. The first stage that fails terminates the query.
    pub fn detect_loop(
        &mut self,
        query: &LcdFrame,
        scores: &[(FrameId, f64)],
        nss_factor: f64,
    ) -> LoopResult {
        let candidates: Vec<(FrameId, f64)> = scores
            .iter()
            .copied()
            .filter(|&(id, _)| id + self.params.dist_local <= query.id)
            .collect();
        if candidates.is_empty() {
            return LoopResult::rejected(LCDStatus::NoMatches, query.id);
        }

        if nss_factor < self.params.min_nss_factor {
            return LoopResult::rejected(LCDStatus::LowNssFactor, query.id);
        }

        let threshold = self.params.alpha * nss_factor;
        let strong: Vec<(FrameId, f64)> = candidates
            .into_iter()
            .filter(|&(_, score)| score >= threshold)
            .collect();
        if strong.is_empty() {
            return LoopResult::rejected(LCDStatus::LowScore, query.id);
        }

        let islands = self.compute_islands(&strong);
        if islands.is_empty() {
            return LoopResult::rejected(LCDStatus::NoGroups, query.id);
        }

        let best_island = islands
            .iter()
            .max_by(|a, b| {
                a.island_score
                    .partial_cmp(&b.island_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .unwrap_or_else(|| islands[0].clone());

        if !self.check_temporal_constraint(query.id, &best_island) {
            return LoopResult::rejected(LCDStatus::FailedTemporalConstraint, query.id);
        }

        let match_id = best_island.best_id;
        let Some(candidate) = self.db.get(match_id) else {
            return LoopResult::rejected(LCDStatus::NoMatches, query.id);
        };

        let Some((verification, matches)) = self.geometric_verification(query, &candidate)
        else {
            return LoopResult::rejected(LCDStatus::FailedGeomVerification, query.id);
        };

        let Some(relative_pose) = self.recover_pose(query, &candidate, &verification, &matches)
        else {
            return LoopResult::rejected(LCDStatus::FailedPoseRecovery, query.id);
        };

        info!(
            query = query.id,
            matched = match_id,
            "loop closure detected"
        );
        LoopResult {
            status: LCDStatus::LoopDetected,
            query_id: query.id,
            match_id,
            relative_pose,
        }
    }

    /// Register one keyframe, emit its odometry factor, run loop detection,
    /// and bundle the current pose-graph payload.
    pub fn spin_once(&mut self, input: LcdInput) -> LcdOutput {
        let mut frame = input.frame;
        frame.timestamp = input.timestamp;
        frame.id_kf = input.cur_kf_id;
        let id = self.db.append(frame.clone());
        frame.id = id;

        self.odom_values.push((id, input.w_pose_blkf.clone()));
        if id > 0 {
            self.factors.push(PoseGraphFactor::Odometry(OdometryFactor {
                cur_key: id,
                w_pose_blkf: input.w_pose_blkf.clone(),
                noise: NoiseModel::isotropic(self.params.odometry_noise_sigma),
            }));
        }

        let result = self.detect_loop(&frame, &input.match_scores, input.nss_factor);
        debug!(
            query = result.query_id,
            status = result.status.as_str(),
            "loop query finished"
        );

        let mut timestamp_match = 0;
        if result.is_loop() {
            if let Some(matched) = self.db.get(result.match_id) {
                timestamp_match = matched.timestamp;
            }
            self.factors
                .push(PoseGraphFactor::LoopClosure(LoopClosureFactor {
                    ref_key: result.match_id,
                    cur_key: result.query_id,
                    ref_pose_cur: result.relative_pose.clone(),
                    noise: NoiseModel::isotropic(self.params.loop_closure_noise_sigma),
                }));
            self.debug_info.pgo_lc_count += 1;
        }
        self.debug_info.pgo_size = self.odom_values.len();

        LcdOutput {
            is_loop: result.is_loop(),
            timestamp_query: input.timestamp,
            timestamp_match,
            id_query: result.query_id,
            id_match: result.match_id,
            relative_pose: result.relative_pose,
            states: self.odom_values.clone(),
            factors: self.factors.clone(),
        }
    }
}
