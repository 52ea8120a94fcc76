//! Export record types
//!
//! The assembled, unquantized result of an export run. This is the only
//! structure the serializers consume; quantization happens at write time.

use glam::{DQuat, DVec3};

use super::header::{AnimHeader, ANIM_SUB_VERSION, ANIM_VERSION};

/// One rotation key, seconds since clip start, export coordinate frame.
#[derive(Debug, Clone, Copy)]
pub struct RotKey {
    pub time: f64,
    pub rot: DQuat,
}

/// One translation key, seconds since clip start, meters, export frame.
#[derive(Debug, Clone, Copy)]
pub struct LocKey {
    pub time: f64,
    pub loc: DVec3,
}

/// One exported joint with its (possibly simplified) keys.
#[derive(Debug, Clone)]
pub struct ExportJoint {
    /// Resolved export name (deform-prefixed)
    pub name: String,
    pub priority: i32,
    pub rot_keys: Vec<RotKey>,
    pub loc_keys: Vec<LocKey>,
    /// Parent scale at bind, compensates quantized locations
    pub pscale: DVec3,
}

impl ExportJoint {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            rot_keys: Vec::new(),
            loc_keys: Vec::new(),
            pscale: DVec3::ONE,
        }
    }

    /// True when the joint carries no keys on either channel.
    pub fn is_silent(&self) -> bool {
        self.rot_keys.is_empty() && self.loc_keys.is_empty()
    }
}

/// The assembled in-memory export, handed to a serializer.
#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub priority: i32,
    /// Clip duration in seconds
    pub duration: f64,
    pub emote_name: String,
    pub loop_in: f64,
    pub loop_out: f64,
    pub looped: bool,
    pub ease_in: f64,
    pub ease_out: f64,
    pub hand_pose: i32,
    pub fps: f64,
    pub frame_start: i32,
    pub frame_end: i32,
    /// Joints in collector-insertion order
    pub joints: Vec<ExportJoint>,
}

impl ExportRecord {
    /// The binary header for this record with the given effective joint
    /// count (after deduplication).
    pub fn header(&self, joint_count: i32) -> AnimHeader {
        AnimHeader {
            version: ANIM_VERSION,
            sub_version: ANIM_SUB_VERSION,
            priority: self.priority,
            duration: self.duration as f32,
            emote_name: self.emote_name.clone(),
            loop_in: self.loop_in as f32,
            loop_out: self.loop_out as f32,
            looped: self.looped,
            ease_in: self.ease_in as f32,
            ease_out: self.ease_out as f32,
            hand_pose: self.hand_pose,
            joint_count,
        }
    }
}
