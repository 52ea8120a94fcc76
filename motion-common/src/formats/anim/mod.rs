//! Quantized binary clip format (.anim)
//!
//! Legacy fixed-layout animation stream, little-endian, no magic bytes.
//!
//! # Layout
//! ```text
//! Header:
//!   version u16, sub_version u16, priority i32, duration f32
//!   emote_name CStr
//!   loop_in f32, loop_out f32, loop i32, ease_in f32, ease_out f32,
//!   hand_pose i32, joint_count i32
//!
//! Per joint, in collector order:
//!   name CStr, priority i32
//!   rot_count i32, then per key: time u16, x u16, y u16, z u16
//!   loc_count i32, then per key: time u16, x u16, y u16, z u16
//!
//! Trailing i32 0 sentinel (always written; the header already declares
//! the joint count, but legacy consumers may key off the sentinel).
//! ```
//!
//! Times quantize over `[0, duration]`; quaternion x/y/z over `[-1, 1]`
//! with w implied non-negative; locations over `[-1, 1]` after parent
//! scale compensation and division by [`MAX_PELVIS_OFFSET`].

mod header;
mod quant;
mod types;
mod writer;

#[cfg(test)]
mod tests;

pub use header::{AnimHeader, ANIM_SUB_VERSION, ANIM_VERSION};
pub use quant::{decode_u16, encode_u16, quant_step};
pub use types::{ExportJoint, ExportRecord, LocKey, RotKey};
pub use writer::{
    read_joint_names, write_anim, AnimError, AnimWriteSummary, MAX_EXPORT_JOINTS,
    MAX_PELVIS_OFFSET,
};
