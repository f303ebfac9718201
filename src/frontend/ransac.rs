//! Robust relative-pose estimation via RANSAC.
//!
//! Four solvers share one loop shape (sample a minimal set, build a model,
//! score inliers, adapt the iteration cap, refit on the consensus set):
//!
//! - mono 2D-2D: 8-point essential estimate over bearing vectors, recovering
//!   rotation + unit translation direction (scale unobservable from mono)
//! - mono 2D-2D given rotation: 2-point translation-direction solver
//! - stereo 3D-3D: 3-point Arun alignment, full 6-DoF pose
//! - stereo 3D-3D given rotation: 1-point translation voting with covariance
//!   propagation for downstream factor weighting
//!
//! Scoring ties are broken by highest inlier count, then lowest summed
//! residual.

use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen, UnitQuaternion, Vector3};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Configuration for the mono (2D-2D) solvers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonoRansacConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold on the epipolar residual |f_ref . (t x R f_cur)|.
    pub threshold: f64,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Probability of finding an uncontaminated sample.
    pub probability: f64,
}

impl Default for MonoRansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            threshold: 1e-3,
            min_inliers: 10,
            probability: 0.99,
        }
    }
}

/// Configuration for the stereo (3D-3D) solvers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoRansacConfig {
    pub max_iterations: usize,
    /// Inlier threshold in meters (point-to-point error).
    pub threshold_m: f64,
    pub min_inliers: usize,
    pub probability: f64,
}

impl Default for StereoRansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            threshold_m: 0.1,
            min_inliers: 6,
            probability: 0.99,
        }
    }
}

/// Result of a relative-pose RANSAC run.
#[derive(Debug, Clone)]
pub struct RansacPoseResult {
    /// Recovered `ref_Pose_cur`: maps current-frame points into the
    /// reference frame. Mono: translation is a unit direction (or zero for
    /// the rotation-only degenerate model).
    pub pose: SE3,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Iterations actually spent.
    pub iterations: usize,
}

/// Result of the stereo translation-given-rotation solver.
#[derive(Debug, Clone)]
pub struct TranslationRansacResult {
    pub translation: Vector3<f64>,
    /// 3x3 covariance of the translation estimate, propagated from the
    /// per-point 3D covariances through the weighted solve.
    pub covariance: Matrix3<f64>,
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

/// Compute adaptive number of RANSAC iterations:
/// k = log(1 - p) / log(1 - w^n) for inlier ratio w and sample size n.
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();
    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}

/// Sample `k` distinct random indices in `0..n`.
fn sample_distinct_indices(rng: &mut impl Rng, k: usize, n: usize) -> Vec<usize> {
    debug_assert!(k <= n);
    let mut indices: Vec<usize> = Vec::with_capacity(k);
    while indices.len() < k {
        let candidate = rng.gen_range(0..n);
        if !indices.contains(&candidate) {
            indices.push(candidate);
        }
    }
    indices
}

fn better_score(inliers: usize, residual: f64, best_inliers: usize, best_residual: f64) -> bool {
    inliers > best_inliers || (inliers == best_inliers && residual < best_residual)
}

// ---------------------------------------------------------------------------
// Mono 2D-2D: essential matrix
// ---------------------------------------------------------------------------

/// Estimate an essential matrix from >= 8 bearing correspondences by solving
/// the stacked epipolar constraint f_ref^T E f_cur = 0 (smallest eigenvector
/// of A^T A), then projecting onto the essential manifold.
fn estimate_essential(
    bearings_ref: &[Vector3<f64>],
    bearings_cur: &[Vector3<f64>],
    indices: &[usize],
) -> Option<Matrix3<f64>> {
    if indices.len() < 8 {
        return None;
    }

    let mut ata: SMatrix<f64, 9, 9> = SMatrix::zeros();
    for &i in indices {
        let fr = bearings_ref[i];
        let fc = bearings_cur[i];
        let row: SVector<f64, 9> = SVector::from_column_slice(&[
            fr.x * fc.x, fr.x * fc.y, fr.x * fc.z,
            fr.y * fc.x, fr.y * fc.y, fr.y * fc.z,
            fr.z * fc.x, fr.z * fc.y, fr.z * fc.z,
        ]);
        ata += row * row.transpose();
    }

    let eigen = SymmetricEigen::new(ata);
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    let e_vec = eigen.eigenvectors.column(min_idx);

    let e = Matrix3::new(
        e_vec[0], e_vec[1], e_vec[2],
        e_vec[3], e_vec[4], e_vec[5],
        e_vec[6], e_vec[7], e_vec[8],
    );

    // Project onto the essential manifold: singular values (1, 1, 0).
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    Some(u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t)
}

/// Triangulate depths for one correspondence under (R, t); returns
/// (depth_ref, depth_cur) or None when the rays are near-parallel.
fn triangulate_depths(
    f_ref: &Vector3<f64>,
    f_cur: &Vector3<f64>,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
) -> Option<(f64, f64)> {
    let a = f_ref;
    let b = rotation * f_cur;
    let c = a.dot(&b);
    let det = 1.0 - c * c;
    if det < 1e-9 {
        return None;
    }
    let at = a.dot(translation);
    let bt = b.dot(translation);
    let d_ref = (at - c * bt) / det;
    let d_cur = (c * at - bt) / det;
    Some((d_ref, d_cur))
}

/// Decompose an essential matrix into the four (R, t) candidates and pick
/// the one passing the cheirality vote; ties fall back to the smallest
/// rotation angle, which also resolves the zero-translation case.
fn decompose_essential(
    e: &Matrix3<f64>,
    bearings_ref: &[Vector3<f64>],
    bearings_cur: &[Vector3<f64>],
    indices: &[usize],
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    let candidates = [(r1, t), (r1, -t), (r2, t), (r2, -t)];

    let mut best: Option<(Matrix3<f64>, Vector3<f64>)> = None;
    let mut best_votes = -1i64;
    let mut best_angle = f64::INFINITY;
    for (r, t_cand) in candidates {
        let mut votes = 0i64;
        for &i in indices {
            if let Some((d_ref, d_cur)) =
                triangulate_depths(&bearings_ref[i], &bearings_cur[i], &r, &t_cand)
            {
                if d_ref > 0.0 && d_cur > 0.0 {
                    votes += 1;
                }
            }
        }
        let angle = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(r),
        )
        .angle();
        if votes > best_votes || (votes == best_votes && angle < best_angle) {
            best_votes = votes;
            best_angle = angle;
            best = Some((r, t_cand));
        }
    }
    best
}

fn epipolar_residual(
    f_ref: &Vector3<f64>,
    f_cur: &Vector3<f64>,
    essential: &Matrix3<f64>,
) -> f64 {
    (f_ref.transpose() * essential * f_cur)[(0, 0)].abs()
}

fn score_essential_model(
    bearings_ref: &[Vector3<f64>],
    bearings_cur: &[Vector3<f64>],
    essential: &Matrix3<f64>,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut residual_sum = 0.0;
    for i in 0..bearings_ref.len() {
        let r = epipolar_residual(&bearings_ref[i], &bearings_cur[i], essential);
        if r < threshold {
            inliers.push(i);
            residual_sum += r;
        }
    }
    (inliers, residual_sum)
}

/// Largest angle between corresponding bearings; used to detect the
/// zero-parallax case where an essential estimate is degenerate.
fn max_angular_disparity(
    bearings_ref: &[Vector3<f64>],
    bearings_cur: &[Vector3<f64>],
) -> f64 {
    bearings_ref
        .iter()
        .zip(bearings_cur.iter())
        .map(|(a, b)| a.dot(b).clamp(-1.0, 1.0).acos())
        .fold(0.0, f64::max)
}

/// Recover rotation + translation direction from 2D-2D bearing
/// correspondences via 8-point RANSAC.
///
/// When the scene shows no measurable parallax at all (consecutive identical
/// frames), the epipolar problem is rank-deficient; the solver then returns
/// the rotation-only model (identity-like rotation, zero translation) with
/// every correspondence inlier rather than an arbitrary epipolar solution.
pub fn ransac_relative_pose_mono(
    bearings_ref: &[Vector3<f64>],
    bearings_cur: &[Vector3<f64>],
    config: &MonoRansacConfig,
) -> Option<RansacPoseResult> {
    let n = bearings_ref.len();
    if n < 8 || n != bearings_cur.len() || n < config.min_inliers {
        return None;
    }

    // Zero-parallax degenerate case: rotation-only model.
    if max_angular_disparity(bearings_ref, bearings_cur) < config.threshold {
        return Some(RansacPoseResult {
            pose: SE3::identity(),
            inliers: (0..n).collect(),
            iterations: 0,
        });
    }

    let mut rng = rand::thread_rng();
    let mut best_model: Option<(Matrix3<f64>, Vec<usize>, f64)> = None;
    let mut best_inliers = 0usize;
    let mut best_residual = f64::INFINITY;
    let mut max_iter = config.max_iterations;
    let mut iterations = 0usize;

    while iterations < max_iter {
        iterations += 1;
        let indices = sample_distinct_indices(&mut rng, 8, n);

        let essential = match estimate_essential(bearings_ref, bearings_cur, &indices) {
            Some(e) => e,
            None => continue,
        };

        let (inliers, residual) =
            score_essential_model(bearings_ref, bearings_cur, &essential, config.threshold);

        if better_score(inliers.len(), residual, best_inliers, best_residual) {
            best_inliers = inliers.len();
            best_residual = residual;
            best_model = Some((essential, inliers, residual));

            if best_inliers >= config.min_inliers {
                let ratio = best_inliers as f64 / n as f64;
                let updated = compute_adaptive_iterations(ratio, config.probability, 8);
                max_iter = max_iter.min(iterations.saturating_add(updated));
            }
        }
    }

    let (essential, inliers, _) = best_model?;
    if inliers.len() < config.min_inliers {
        return None;
    }

    // Refit on the full consensus set.
    let (essential, inliers) =
        match estimate_essential(bearings_ref, bearings_cur, &inliers) {
            Some(refit) => {
                let (new_inliers, _) =
                    score_essential_model(bearings_ref, bearings_cur, &refit, config.threshold);
                if new_inliers.len() >= inliers.len() {
                    (refit, new_inliers)
                } else {
                    (essential, inliers)
                }
            }
            None => (essential, inliers),
        };

    let (rotation, translation) =
        decompose_essential(&essential, bearings_ref, bearings_cur, &inliers)?;

    Some(RansacPoseResult {
        pose: SE3::from_rt(rotation, translation),
        inliers,
        iterations,
    })
}

// ---------------------------------------------------------------------------
// Mono 2D-2D given rotation: 2-point translation direction
// ---------------------------------------------------------------------------

/// Recover the translation direction from bearing correspondences when the
/// inter-frame rotation is known (e.g. from IMU integration).
///
/// Each correspondence constrains t to the epipolar plane normal
/// n_i = f_ref x (R f_cur); the minimal 2-point model is t = n_1 x n_2.
pub fn ransac_translation_given_rotation_mono(
    bearings_ref: &[Vector3<f64>],
    bearings_cur: &[Vector3<f64>],
    rotation: &UnitQuaternion<f64>,
    config: &MonoRansacConfig,
) -> Option<RansacPoseResult> {
    let n = bearings_ref.len();
    if n < 2 || n != bearings_cur.len() || n < config.min_inliers {
        return None;
    }

    let r = rotation.to_rotation_matrix().into_inner();
    let normals: Vec<Vector3<f64>> = bearings_ref
        .iter()
        .zip(bearings_cur.iter())
        .map(|(fr, fc)| fr.cross(&(r * fc)))
        .collect();

    // Zero-parallax: all normals vanish, translation direction unobservable.
    if normals.iter().all(|nv| nv.norm() < config.threshold) {
        return Some(RansacPoseResult {
            pose: SE3 {
                rotation: *rotation,
                translation: Vector3::zeros(),
            },
            inliers: (0..n).collect(),
            iterations: 0,
        });
    }

    let residual = |t: &Vector3<f64>, nv: &Vector3<f64>| -> f64 {
        let norm = nv.norm();
        if norm < 1e-12 {
            // Degenerate normal constrains nothing: always consistent.
            0.0
        } else {
            t.dot(nv).abs() / norm
        }
    };

    let mut rng = rand::thread_rng();
    let mut best_t: Option<Vector3<f64>> = None;
    let mut best_inlier_set = Vec::new();
    let mut best_inliers = 0usize;
    let mut best_residual = f64::INFINITY;
    let mut max_iter = config.max_iterations;
    let mut iterations = 0usize;

    while iterations < max_iter {
        iterations += 1;
        let indices = sample_distinct_indices(&mut rng, 2, n);
        let t_dir = normals[indices[0]].cross(&normals[indices[1]]);
        if t_dir.norm() < 1e-12 {
            continue;
        }
        let t_dir = t_dir.normalize();

        let mut inliers = Vec::new();
        let mut residual_sum = 0.0;
        for (i, nv) in normals.iter().enumerate() {
            let res = residual(&t_dir, nv);
            if res < config.threshold {
                inliers.push(i);
                residual_sum += res;
            }
        }

        if better_score(inliers.len(), residual_sum, best_inliers, best_residual) {
            best_inliers = inliers.len();
            best_residual = residual_sum;
            best_t = Some(t_dir);
            best_inlier_set = inliers;

            if best_inliers >= config.min_inliers {
                let ratio = best_inliers as f64 / n as f64;
                let updated = compute_adaptive_iterations(ratio, config.probability, 2);
                max_iter = max_iter.min(iterations.saturating_add(updated));
            }
        }
    }

    let mut t_dir = best_t?;
    if best_inlier_set.len() < config.min_inliers {
        return None;
    }

    // Refit: smallest eigenvector of the stacked normal constraints.
    let mut nn = Matrix3::zeros();
    for &i in &best_inlier_set {
        nn += normals[i] * normals[i].transpose();
    }
    let eigen = SymmetricEigen::new(nn);
    if let Some((min_idx, _)) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        let refined = eigen.eigenvectors.column(min_idx).into_owned();
        if refined.norm() > 1e-12 {
            t_dir = refined.normalize();
        }
    }

    // Resolve the sign ambiguity by voting on positive depths.
    let mut positive = 0usize;
    let mut negative = 0usize;
    for &i in &best_inlier_set {
        if let Some((d_ref, d_cur)) =
            triangulate_depths(&bearings_ref[i], &bearings_cur[i], &r, &t_dir)
        {
            if d_ref > 0.0 && d_cur > 0.0 {
                positive += 1;
            }
        }
        if let Some((d_ref, d_cur)) =
            triangulate_depths(&bearings_ref[i], &bearings_cur[i], &r, &(-t_dir))
        {
            if d_ref > 0.0 && d_cur > 0.0 {
                negative += 1;
            }
        }
    }
    if negative > positive {
        t_dir = -t_dir;
    }

    Some(RansacPoseResult {
        pose: SE3 {
            rotation: *rotation,
            translation: t_dir,
        },
        inliers: best_inlier_set,
        iterations,
    })
}

// ---------------------------------------------------------------------------
// Stereo 3D-3D: Arun's method
// ---------------------------------------------------------------------------

/// Closed-form rigid alignment (Arun's method): finds (R, t) such that
/// points_ref ~= R * points_cur + t, via SVD of the cross-covariance.
fn compute_arun_alignment(
    points_ref: &[Vector3<f64>],
    points_cur: &[Vector3<f64>],
    indices: &[usize],
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    if indices.len() < 3 {
        return None;
    }

    let inv_n = 1.0 / indices.len() as f64;
    let centroid_ref: Vector3<f64> =
        indices.iter().map(|&i| points_ref[i]).sum::<Vector3<f64>>() * inv_n;
    let centroid_cur: Vector3<f64> =
        indices.iter().map(|&i| points_cur[i]).sum::<Vector3<f64>>() * inv_n;

    let mut h = Matrix3::zeros();
    for &i in indices {
        h += (points_cur[i] - centroid_cur) * (points_ref[i] - centroid_ref).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation = v_t.transpose() * u.transpose();
    // Handle the reflection case (det(R) = -1).
    if rotation.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation = v * u.transpose();
    }

    let translation = centroid_ref - rotation * centroid_cur;
    Some((rotation, translation))
}

fn score_rigid_model(
    points_ref: &[Vector3<f64>],
    points_cur: &[Vector3<f64>],
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    threshold_m: f64,
) -> (Vec<usize>, f64) {
    let threshold_sq = threshold_m * threshold_m;
    let mut inliers = Vec::new();
    let mut residual_sum = 0.0;
    for i in 0..points_ref.len() {
        let err_sq = (points_ref[i] - (rotation * points_cur[i] + translation)).norm_squared();
        if err_sq < threshold_sq {
            inliers.push(i);
            residual_sum += err_sq;
        }
    }
    (inliers, residual_sum)
}

/// Recover the full 6-DoF relative pose from 3D-3D correspondences via
/// 3-point Arun RANSAC (translation scale observable from stereo depth).
pub fn ransac_alignment_arun(
    points_ref: &[Vector3<f64>],
    points_cur: &[Vector3<f64>],
    config: &StereoRansacConfig,
) -> Option<RansacPoseResult> {
    let n = points_ref.len();
    if n < 3 || n != points_cur.len() || n < config.min_inliers {
        return None;
    }

    let mut rng = rand::thread_rng();
    let mut best: Option<(Matrix3<f64>, Vector3<f64>, Vec<usize>)> = None;
    let mut best_inliers = 0usize;
    let mut best_residual = f64::INFINITY;
    let mut max_iter = config.max_iterations;
    let mut iterations = 0usize;

    while iterations < max_iter {
        iterations += 1;
        let indices = sample_distinct_indices(&mut rng, 3, n);

        let (rotation, translation) =
            match compute_arun_alignment(points_ref, points_cur, &indices) {
                Some(model) => model,
                None => continue,
            };

        let (inliers, residual) = score_rigid_model(
            points_ref,
            points_cur,
            &rotation,
            &translation,
            config.threshold_m,
        );

        if better_score(inliers.len(), residual, best_inliers, best_residual) {
            best_inliers = inliers.len();
            best_residual = residual;
            best = Some((rotation, translation, inliers));

            if best_inliers >= config.min_inliers {
                let ratio = best_inliers as f64 / n as f64;
                let updated = compute_adaptive_iterations(ratio, config.probability, 3);
                max_iter = max_iter.min(iterations.saturating_add(updated));
            }
        }
    }

    let (mut rotation, mut translation, mut inliers) = best?;
    if inliers.len() < config.min_inliers {
        return None;
    }

    // Refine with all inliers.
    if let Some((refined_r, refined_t)) =
        compute_arun_alignment(points_ref, points_cur, &inliers)
    {
        let (new_inliers, _) = score_rigid_model(
            points_ref,
            points_cur,
            &refined_r,
            &refined_t,
            config.threshold_m,
        );
        if new_inliers.len() >= inliers.len() {
            rotation = refined_r;
            translation = refined_t;
            inliers = new_inliers;
        }
    }

    Some(RansacPoseResult {
        pose: SE3::from_rt(rotation, translation),
        inliers,
        iterations,
    })
}

// ---------------------------------------------------------------------------
// Stereo 3D-3D given rotation: 1-point translation + covariance
// ---------------------------------------------------------------------------

/// Recover the translation (and its covariance) from 3D-3D correspondences
/// with externally supplied rotation.
///
/// Each correspondence votes t_i = p_ref - R p_cur; consensus is found by
/// 1-point RANSAC, then the inlier votes are fused with an
/// information-weighted mean using the per-point covariances. The returned
/// covariance is the inverse summed information of the consensus set.
pub fn ransac_translation_given_rotation_stereo(
    points_ref: &[Vector3<f64>],
    points_cur: &[Vector3<f64>],
    covariances_ref: &[Matrix3<f64>],
    covariances_cur: &[Matrix3<f64>],
    rotation: &UnitQuaternion<f64>,
    config: &StereoRansacConfig,
) -> Option<TranslationRansacResult> {
    let n = points_ref.len();
    if n == 0
        || n != points_cur.len()
        || n != covariances_ref.len()
        || n != covariances_cur.len()
        || n < config.min_inliers
    {
        return None;
    }

    let r = rotation.to_rotation_matrix().into_inner();
    let votes: Vec<Vector3<f64>> = points_ref
        .iter()
        .zip(points_cur.iter())
        .map(|(p_ref, p_cur)| p_ref - r * p_cur)
        .collect();

    let mut rng = rand::thread_rng();
    let mut best_inlier_set: Vec<usize> = Vec::new();
    let mut best_residual = f64::INFINITY;
    let mut max_iter = config.max_iterations;
    let mut iterations = 0usize;
    let threshold_sq = config.threshold_m * config.threshold_m;

    while iterations < max_iter {
        iterations += 1;
        let pivot = rng.gen_range(0..n);
        let t_model = votes[pivot];

        let mut inliers = Vec::new();
        let mut residual_sum = 0.0;
        for (i, vote) in votes.iter().enumerate() {
            let err_sq = (vote - t_model).norm_squared();
            if err_sq < threshold_sq {
                inliers.push(i);
                residual_sum += err_sq;
            }
        }

        if better_score(inliers.len(), residual_sum, best_inlier_set.len(), best_residual) {
            best_residual = residual_sum;
            best_inlier_set = inliers;

            if best_inlier_set.len() >= config.min_inliers {
                let ratio = best_inlier_set.len() as f64 / n as f64;
                let updated = compute_adaptive_iterations(ratio, config.probability, 1);
                max_iter = max_iter.min(iterations.saturating_add(updated));
            }
        }
    }

    if best_inlier_set.len() < config.min_inliers {
        return None;
    }

    // Information-weighted fusion over the consensus set.
    let mut info_sum = Matrix3::zeros();
    let mut weighted_votes = Vector3::zeros();
    for &i in &best_inlier_set {
        let vote_cov = covariances_ref[i] + r * covariances_cur[i] * r.transpose();
        let info = vote_cov.try_inverse()?;
        info_sum += info;
        weighted_votes += info * votes[i];
    }
    let covariance = info_sum.try_inverse()?;
    let translation = covariance * weighted_votes;

    Some(TranslationRansacResult {
        translation,
        covariance,
        inliers: best_inlier_set,
        iterations,
    })
}

// Keep the essential-from-pose helper visible to tests.
#[cfg(test)]
pub(crate) fn essential_from_pose(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    crate::geometry::skew(translation) * rotation
}
