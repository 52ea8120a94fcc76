//! Run configuration (export.toml)
//!
//! Everything an export run can be told, loadable from TOML with CLI
//! overrides layered on top. Field defaults match the legacy exporter's
//! panel defaults.

use anyhow::Context;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use motion_common::skeleton::Skeleton;

/// Keyframe reduction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Simplification {
    /// Keep every sampled frame
    None,
    /// Reduce each channel against its own feature curve
    PerChannel,
    /// Reduce once against all channels' concatenated features
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// First exported frame; defaults to the clip's keyed range
    #[serde(default)]
    pub frame_start: Option<i32>,
    /// Last exported frame, inclusive; defaults to the clip's keyed range
    #[serde(default)]
    pub frame_end: Option<i32>,

    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Per-joint priority overrides by export name
    #[serde(default)]
    pub priorities: HashMap<String, i32>,

    #[serde(default)]
    pub looped: bool,
    /// Loop entry frame; defaults to the first exported frame
    #[serde(default)]
    pub loop_in: Option<i32>,
    /// Loop exit frame; defaults to the last exported frame
    #[serde(default)]
    pub loop_out: Option<i32>,

    #[serde(default = "default_ease")]
    pub ease_in: f64,
    #[serde(default = "default_ease")]
    pub ease_out: f64,

    #[serde(default = "default_hand_pose")]
    pub hand_pose: i32,
    #[serde(default)]
    pub emote_name: String,

    /// Export translation channels beyond the pelvis
    #[serde(default)]
    pub with_translation: bool,
    /// Align the retarget reference in rest pose instead of at a frame
    #[serde(default)]
    pub use_restpose: bool,
    /// Populate rest metadata from bind matrices instead of rest matrices
    #[serde(default = "default_true")]
    pub use_bind_pose: bool,
    /// Reference frame for retarget alignment
    #[serde(default)]
    pub reference_frame: Option<i32>,
    /// Keep the reference frame in the exported clip
    #[serde(default)]
    pub keep_reference_frame: bool,

    #[serde(default = "default_simplification")]
    pub simplification: Simplification,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Trailing location frames blended toward the first sample
    #[serde(default)]
    pub seamless_loc_frames: u32,
    /// Trailing rotation frames blended toward the first sample
    #[serde(default)]
    pub seamless_rot_frames: u32,

    /// Multiply exported locations by the armature object scale
    #[serde(default)]
    pub apply_armature_scale: bool,

    /// Expected-parent overrides for the hierarchy-changed heuristic
    #[serde(default)]
    pub parent_overrides: HashMap<String, String>,

    /// Source-to-target bone mapping for retarget runs; empty maps every
    /// bone name shared by both skeletons onto itself
    #[serde(default)]
    pub retarget_map: HashMap<String, String>,
    /// Source center bone for retarget alignment; defaults to the pelvis
    #[serde(default)]
    pub center_source: Option<String>,
    /// Target center bone for retarget alignment; defaults to the mapped
    /// source center
    #[serde(default)]
    pub center_target: Option<String>,
}

fn default_fps() -> f64 {
    24.0
}
fn default_priority() -> i32 {
    3
}
fn default_ease() -> f64 {
    0.8
}
fn default_hand_pose() -> i32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_simplification() -> Simplification {
    Simplification::PerChannel
}
fn default_tolerance() -> f64 {
    0.01
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            frame_start: None,
            frame_end: None,
            priority: default_priority(),
            priorities: HashMap::new(),
            looped: false,
            loop_in: None,
            loop_out: None,
            ease_in: default_ease(),
            ease_out: default_ease(),
            hand_pose: default_hand_pose(),
            emote_name: String::new(),
            with_translation: false,
            use_restpose: false,
            use_bind_pose: true,
            reference_frame: None,
            keep_reference_frame: false,
            simplification: default_simplification(),
            tolerance: default_tolerance(),
            seamless_loc_frames: 0,
            seamless_rot_frames: 0,
            apply_armature_scale: false,
            parent_overrides: HashMap::new(),
            retarget_map: HashMap::new(),
            center_source: None,
            center_target: None,
        }
    }
}

impl ExportConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Invalid config: {:?}", path))
    }

    /// Effective priority of a joint: the per-joint table wins over the
    /// bone's declared priority, which wins over the clip priority.
    pub fn joint_priority(&self, skel: &Skeleton, name: &str) -> i32 {
        if let Some(p) = self.priorities.get(name) {
            return *p;
        }
        skel.bone(name)
            .and_then(|b| b.priority)
            .unwrap_or(self.priority)
    }
}
