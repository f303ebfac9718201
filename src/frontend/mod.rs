//! Visual frontend: feature bookkeeping, flow prediction, and geometric
//! outlier rejection between consecutive (stereo) frames.

pub mod camera;
pub mod frame;
pub mod matching;
pub mod optical_flow;
pub mod ransac;
pub mod tracker;

pub use camera::{CameraMask, CameraParams, StereoCamera};
pub use frame::{Frame, FrameId, KeypointStatus, LandmarkId, StereoFrame, Timestamp};
pub use tracker::{Tracker, TrackerParams, TrackingStatus};
