//! Shared types and wire formats for the motion export tools
//!
//! This crate provides everything the exporters agree on:
//! - [`skeleton`] - Bone/skeleton data model and per-bone rest metadata
//! - [`motion`] - Channel sets and sampled per-frame pose data
//! - [`rig`] - Avatar rig naming conventions (deform prefix, aliases, chains)
//! - [`simplify`] - Tolerance-bounded keyframe reduction
//! - [`formats`] - The `.anim` binary format and the BVH text format

pub mod formats;
pub mod motion;
pub mod rig;
pub mod simplify;
pub mod skeleton;

// Re-export commonly used format items
pub use formats::{
    anim::{
        decode_u16, encode_u16, quant_step, write_anim, AnimError, AnimHeader, AnimWriteSummary,
        ExportJoint, ExportRecord, LocKey, RotKey, ANIM_VERSION, MAX_EXPORT_JOINTS,
        MAX_PELVIS_OFFSET,
    },
    bvh::{write_bvh, BvhError, BvhOptions, ReferenceLine},
};

// Re-export the data model
pub use motion::{ChannelSet, FrameSample, SampledMotion};
pub use skeleton::{Bone, BoneRestInfo, Skeleton, SkeletonError};
