//! motion-export library
//!
//! The capture/export pipeline around the wire formats in
//! `motion-common`: keyed-clip model, pose evaluation, channel
//! collection, per-frame sampling, retargeting and record assembly.
//! The CLI in `main.rs` is a thin driver over these modules.

pub mod channels;
pub mod clip;
pub mod config;
pub mod evaluate;
pub mod export;
pub mod gltf_src;
pub mod retarget;
pub mod sample;

// Re-export the pieces callers wire together
pub use channels::{collect_channels, CollectError, CollectOptions, DriverGraph};
pub use clip::{Action, ClipLayer, ClipSource, CurveData, FCurve, Key};
pub use config::{ExportConfig, Simplification};
pub use evaluate::{ClipEvaluator, ConstraintGuard, FrameGuard, PoseEvaluator, RestPoseGuard};
pub use export::{build_record, ExportReport, ProgressCounter};
pub use retarget::{BoneMap, RetargetError, RetargetOptions, RetargetSession};
pub use sample::{sample_range, SampleError};
