//! Geometric-verification core for a visual(-inertial) odometry pipeline:
//! feature tracking with robust outlier rejection between frames, and
//! loop-closure candidate validation with pose-graph factor emission.
//!
//! Image-level primitives (corner extraction, KLT refinement, BoW scoring)
//! and the nonlinear optimizer are external collaborators; this crate owns
//! the geometry in between.

pub mod frontend;
pub mod geometry;
pub mod loop_closure;
pub mod pipeline;
