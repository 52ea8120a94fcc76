//! Export record assembly
//!
//! Turns collected channels plus sampled motion into the `ExportRecord`
//! the serializers consume: simplifies each bone's keys per the run
//! policy, rotates values into the export coordinate frame and resolves
//! per-joint priorities. Also home to the run report and the progress
//! counter a caller-level watchdog can poll.

use glam::{DQuat, DVec3};
use std::cell::Cell;
use std::collections::BTreeSet;

use motion_common::formats::anim::{ExportJoint, ExportRecord, LocKey, RotKey};
use motion_common::motion::{ChannelSet, SampledMotion};
use motion_common::simplify::{simplify_pinned, CurvePoint, Features};
use motion_common::skeleton::Skeleton;

use crate::config::{ExportConfig, Simplification};

/// Caller-visible progress, advanced once per sampled frame. The core
/// never checks for cancellation itself; a watchdog may poll this.
#[derive(Debug, Default)]
pub struct ProgressCounter(Cell<u64>);

impl ProgressCounter {
    pub fn advance(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// Recoverable conditions accumulated over an export run. Fatal errors
/// raise immediately; everything here only degrades the result.
#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    /// Curve bones that resolved to nothing in the skeleton
    pub unresolved_curves: Vec<String>,
    /// (frame, bone) samples the evaluator could not produce
    pub missing_samples: Vec<(i32, String)>,
    /// Joints announced with no key data at all
    pub silent_joints: Vec<String>,
    /// Joints skipped as duplicate resolved names
    pub duplicate_joints: Vec<String>,
    /// Unknown legacy bone-store entries skipped during retarget
    pub skipped_entries: Vec<String>,
}

impl ExportReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved_curves.is_empty()
            && self.missing_samples.is_empty()
            && self.silent_joints.is_empty()
            && self.duplicate_joints.is_empty()
    }

    /// Log everything that degraded the run.
    pub fn log_summary(&self) {
        if !self.unresolved_curves.is_empty() {
            tracing::warn!(
                "{} curve bone(s) not found in the skeleton: {:?}",
                self.unresolved_curves.len(),
                self.unresolved_curves
            );
        }
        if !self.missing_samples.is_empty() {
            tracing::warn!(
                "{} pose sample(s) could not be evaluated and were omitted",
                self.missing_samples.len()
            );
        }
        if !self.silent_joints.is_empty() {
            tracing::warn!("joint(s) exported with no data: {:?}", self.silent_joints);
        }
        if !self.duplicate_joints.is_empty() {
            tracing::warn!(
                "duplicate resolved joint name(s) skipped: {:?}",
                self.duplicate_joints
            );
        }
        for entry in &self.skipped_entries {
            tracing::debug!("skipped legacy bone-store entry '{entry}'");
        }
    }
}

/// Rotation from the internal frame (Z-up, avatar facing -Y) into the
/// consumer's frame (Z-up, avatar facing +X).
fn export_frame_rot() -> DQuat {
    DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2)
}

/// Per-bone values already rotated into the export frame.
struct BoneTrack {
    name: String,
    frames: Vec<i32>,
    rots: Vec<DQuat>,
    locs: Vec<DVec3>,
}

fn bone_track(
    name: &str,
    motion: &SampledMotion,
    loc_scale: f64,
) -> BoneTrack {
    let swap = export_frame_rot();
    let mut track = BoneTrack {
        name: name.to_string(),
        frames: Vec::new(),
        rots: Vec::new(),
        locs: Vec::new(),
    };
    for frame in motion.frames() {
        let Some(sample) = motion.get(frame, name) else {
            continue; // omitted sample, the key is simply absent
        };
        let q = DQuat::from_mat4(&sample.visual).normalize();
        track.frames.push(frame);
        track.rots.push((swap * q * swap.inverse()).normalize());
        track.locs.push(swap * (sample.visual.w_axis.truncate() * loc_scale));
    }
    track
}

fn track_points(track: &BoneTrack, with_rot: bool, with_loc: bool) -> Vec<CurvePoint> {
    track
        .frames
        .iter()
        .enumerate()
        .map(|(i, &frame)| {
            let mut features = Features::new();
            if with_rot {
                let q = track.rots[i];
                features.extend([q.x, q.y, q.z, q.w]);
            }
            if with_loc {
                let l = track.locs[i];
                features.extend([l.x, l.y, l.z]);
            }
            CurvePoint { frame, features }
        })
        .collect()
}

/// Frames pinned through simplification: loop markers when looping.
fn pinned_frames(cfg: &ExportConfig, start: i32, end: i32) -> BTreeSet<i32> {
    let mut pinned = BTreeSet::new();
    if cfg.looped {
        pinned.insert(cfg.loop_in.unwrap_or(start).clamp(start, end));
        pinned.insert(cfg.loop_out.unwrap_or(end).clamp(start, end));
    }
    pinned
}

/// Assemble the export record from collected channels and sampled motion.
pub fn build_record(
    skel: &Skeleton,
    channels: &ChannelSet,
    motion: &SampledMotion,
    cfg: &ExportConfig,
) -> ExportRecord {
    let first = motion.frames().next().unwrap_or(0);
    let last = motion.frames().last().unwrap_or(first);
    let start = cfg.frame_start.unwrap_or(first);
    let end = cfg.frame_end.unwrap_or(last);
    let fps = cfg.fps;
    let duration = f64::from(end - start).max(0.0) / fps;
    let pinned = pinned_frames(cfg, start, end);
    let loc_scale = if cfg.apply_armature_scale { skel.scale } else { 1.0 };

    let tracks: Vec<BoneTrack> = channels
        .order()
        .iter()
        .map(|name| bone_track(name, motion, loc_scale))
        .collect();

    // the global policy reduces one concatenated feature curve and every
    // channel shares the kept frame set
    let global_kept: Option<BTreeSet<i32>> = match cfg.simplification {
        Simplification::Global => {
            let frames: Vec<i32> = motion.frames().collect();
            let points: Vec<CurvePoint> = frames
                .iter()
                .map(|&frame| {
                    let mut features = Features::new();
                    for track in &tracks {
                        match track.frames.iter().position(|&f| f == frame) {
                            Some(i) => {
                                let q = track.rots[i];
                                let l = track.locs[i];
                                features.extend([q.x, q.y, q.z, q.w, l.x, l.y, l.z]);
                            }
                            None => {
                                features.extend([0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
                            }
                        }
                    }
                    CurvePoint { frame, features }
                })
                .collect();
            Some(simplify_pinned(&points, cfg.tolerance, &pinned))
        }
        _ => None,
    };

    let mut joints = Vec::with_capacity(tracks.len());
    for track in &tracks {
        let has_rot = channels.has_rot(&track.name);
        let has_loc = channels.has_loc(&track.name);
        let kept: BTreeSet<i32> = match cfg.simplification {
            Simplification::None => track.frames.iter().copied().collect(),
            Simplification::PerChannel => {
                let points = track_points(track, has_rot, has_loc);
                simplify_pinned(&points, cfg.tolerance, &pinned)
            }
            Simplification::Global => global_kept.clone().unwrap_or_default(),
        };

        let mut joint = ExportJoint::new(track.name.as_str(), cfg.joint_priority(skel, &track.name));
        if let Some(info) = channels.rest_info(&track.name) {
            joint.pscale = info.pscale0;
        }
        for (i, &frame) in track.frames.iter().enumerate() {
            if !kept.contains(&frame) {
                continue;
            }
            let time = f64::from(frame - start) / fps;
            if has_rot {
                joint.rot_keys.push(RotKey { time, rot: track.rots[i] });
            }
            if has_loc {
                joint.loc_keys.push(LocKey { time, loc: track.locs[i] });
            }
        }
        joints.push(joint);
    }

    ExportRecord {
        priority: cfg.priority,
        duration,
        emote_name: cfg.emote_name.clone(),
        loop_in: f64::from(cfg.loop_in.unwrap_or(start) - start) / fps,
        loop_out: f64::from(cfg.loop_out.unwrap_or(end) - start) / fps,
        looped: cfg.looped,
        ease_in: cfg.ease_in,
        ease_out: cfg.ease_out,
        hand_pose: cfg.hand_pose,
        fps,
        frame_start: start,
        frame_end: end,
        joints,
    }
}
