//! Loop-closure candidate validation: keyframe database, match-island
//! grouping, staged rejection pipeline, and pose-graph factor emission.

pub mod db;
pub mod definitions;
pub mod detector;

pub use db::LcdFrameDatabase;
pub use definitions::{
    LCDStatus, LcdFrame, LcdInput, LcdOutput, LoopClosureFactor, LoopResult, MatchIsland,
    OdometryFactor, PoseGraphFactor,
};
pub use detector::{LcdParams, LoopClosureDetector};
