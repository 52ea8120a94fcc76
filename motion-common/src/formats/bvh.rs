//! Hierarchical text serializer (BVH)
//!
//! Writes the skeleton as an indented `HIERARCHY` block followed by a
//! `MOTION` block with one line of channel values per kept frame. The
//! consumer's convention is Y-up with offsets in inches, so positions are
//! axis-swapped from the internal Z-up meter frame on the way out.
//!
//! Joint names come from the legacy table in [`crate::rig`]; bones
//! without a table entry are not export-eligible and are skipped, with
//! their offsets folded into the nearest emitted descendant.

use glam::{DMat4, DQuat, DVec3, EulerRot};
use std::collections::BTreeSet;
use std::io::{self, Write};

use crate::motion::{ChannelSet, SampledMotion};
use crate::rig;
use crate::skeleton::Skeleton;

/// Legacy inch, in meters.
pub const INCH_TO_METER: f64 = 0.02540005;

/// Axis swap from the internal frame (Z-up) to the BVH frame (Y-up).
fn swap_axes(v: DVec3) -> DVec3 {
    DVec3::new(v.x, v.z, -v.y)
}

fn to_inches(v: DVec3) -> DVec3 {
    swap_axes(v) / INCH_TO_METER
}

/// Rotation of a matrix re-expressed in the BVH frame, as XYZ Euler
/// degrees in channel order.
fn to_bvh_euler(m: &DMat4) -> DVec3 {
    let swap = DQuat::from_rotation_x(-std::f64::consts::FRAC_PI_2);
    let q = (swap * DQuat::from_mat4(m).normalize() * swap.inverse()).normalize();
    let (x, y, z) = q.to_euler(EulerRot::XYZ);
    DVec3::new(x.to_degrees(), y.to_degrees(), z.to_degrees())
}

/// How the optional leading reference line is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceLine {
    /// All rotations zeroed, root held at its rest height
    Frozen,
    /// The ordinary per-frame algorithm run at the reference frame, with
    /// below-threshold channels zeroed (marked restpose)
    BoneLock,
}

#[derive(Debug, Clone)]
pub struct BvhOptions {
    pub fps: f64,
    /// Emit a synthetic leading reference line
    pub reference_line: Option<ReferenceLine>,
    /// Frame the bone-lock reference line reads its values from
    pub reference_frame: i32,
    /// Channel magnitude under which a bone-lock value reads as restpose
    pub lock_threshold: f64,
}

impl Default for BvhOptions {
    fn default() -> Self {
        Self {
            fps: 24.0,
            reference_line: None,
            reference_frame: 0,
            lock_threshold: 0.0001,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BvhError {
    /// No frames were collected; the file must not be left with
    /// `Frames: 0`
    #[error("no frames available for text export")]
    NoFrames,

    #[error("skeleton has no root bone '{0}'")]
    MissingRoot(&'static str),

    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// One emitted joint. Offsets are parent-relative meters in the internal
/// frame; skipped (ineligible) ancestors fold their offsets in here.
struct Joint {
    bone: String,
    bvh_name: &'static str,
    offset: DVec3,
    tail: DVec3,
    has_loc: bool,
    children: Vec<Joint>,
}

fn is_needed(skel: &Skeleton, channels: &ChannelSet, bone: &str) -> bool {
    channels
        .order()
        .iter()
        .any(|animated| skel.is_ancestor_or_self(bone, animated))
}

fn build_joint(
    skel: &Skeleton,
    channels: &ChannelSet,
    bone: &str,
    carried_offset: DVec3,
) -> Option<Joint> {
    let b = skel.bone(bone)?;
    let bvh_name = rig::bvh_name(bone)?;
    let mut children = Vec::new();
    collect_children(skel, channels, bone, DVec3::ZERO, &mut children);
    Some(Joint {
        bone: bone.to_string(),
        bvh_name,
        offset: b.rest_head + carried_offset,
        tail: b.rest_tail - b.rest_head,
        has_loc: channels.has_loc(bone),
        children,
    })
}

/// Gather the emitted children of `bone`, descending through needed but
/// ineligible bones while accumulating their offsets.
fn collect_children(
    skel: &Skeleton,
    channels: &ChannelSet,
    bone: &str,
    carried: DVec3,
    out: &mut Vec<Joint>,
) {
    for child in skel.children_of(bone) {
        if !is_needed(skel, channels, &child.name) {
            continue;
        }
        if rig::bvh_name(&child.name).is_some() {
            if let Some(joint) = build_joint(skel, channels, &child.name, carried) {
                out.push(joint);
            }
        } else {
            collect_children(skel, channels, &child.name, carried + child.rest_head, out);
        }
    }
}

fn write_offset<W: Write>(w: &mut W, depth: usize, offset: DVec3) -> io::Result<()> {
    let o = to_inches(offset);
    writeln!(
        w,
        "{}OFFSET {:.4} {:.4} {:.4}",
        "\t".repeat(depth),
        o.x,
        o.y,
        o.z
    )
}

fn write_joint<W: Write>(w: &mut W, joint: &Joint, depth: usize, is_root: bool) -> io::Result<()> {
    let indent = "\t".repeat(depth);
    if is_root {
        writeln!(w, "ROOT {}", rig::BVH_ROOT)?;
    } else {
        writeln!(w, "{}JOINT {}", indent, joint.bvh_name)?;
    }
    writeln!(w, "{indent}{{")?;
    write_offset(w, depth + 1, joint.offset)?;
    if is_root || joint.has_loc {
        writeln!(
            w,
            "{indent}\tCHANNELS 6 Xposition Yposition Zposition Xrotation Yrotation Zrotation"
        )?;
    } else {
        writeln!(w, "{indent}\tCHANNELS 3 Xrotation Yrotation Zrotation")?;
    }
    if joint.children.is_empty() {
        writeln!(w, "{indent}\tEnd Site")?;
        writeln!(w, "{indent}\t{{")?;
        write_offset(w, depth + 2, joint.tail)?;
        writeln!(w, "{indent}\t}}")?;
    } else {
        for child in &joint.children {
            write_joint(w, child, depth + 1, false)?;
        }
    }
    writeln!(w, "{indent}}}")
}

/// Channel values of one joint for one motion line.
fn joint_values(
    joint: &Joint,
    is_root: bool,
    motion: &SampledMotion,
    frame: i32,
    rest_root: DVec3,
) -> Vec<f64> {
    let mut values = Vec::with_capacity(6);
    let sample = motion.get(frame, &joint.bone);
    if is_root || joint.has_loc {
        let loc = match sample {
            Some(s) if is_root => to_inches(s.pose.w_axis.truncate()),
            Some(s) => {
                let local = s.parent_pose.inverse() * s.pose;
                to_inches(local.w_axis.truncate())
            }
            // missing sample: hold the rest offset
            None if is_root => to_inches(rest_root),
            None => to_inches(joint.offset),
        };
        values.extend([loc.x, loc.y, loc.z]);
    }
    let rot = match sample {
        Some(s) => to_bvh_euler(&s.visual),
        None => DVec3::ZERO,
    };
    values.extend([rot.x, rot.y, rot.z]);
    values
}

fn push_line_values(
    joint: &Joint,
    is_root: bool,
    motion: &SampledMotion,
    frame: i32,
    rest_root: DVec3,
    out: &mut Vec<f64>,
) {
    out.extend(joint_values(joint, is_root, motion, frame, rest_root));
    for child in &joint.children {
        push_line_values(child, false, motion, frame, rest_root, out);
    }
}

/// Reference-line values: rest offsets, zero rotations, root at rest
/// height.
fn push_frozen_values(joint: &Joint, is_root: bool, rest_root: DVec3, out: &mut Vec<f64>) {
    if is_root || joint.has_loc {
        let o = to_inches(if is_root { rest_root } else { joint.offset });
        out.extend([o.x, o.y, o.z]);
    }
    out.extend([0.0, 0.0, 0.0]);
    for child in &joint.children {
        push_frozen_values(child, false, rest_root, out);
    }
}

fn write_line<W: Write>(w: &mut W, values: &[f64]) -> io::Result<()> {
    let mut line = String::with_capacity(values.len() * 10);
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&format!("{v:.4}"));
    }
    writeln!(w, "{line}")
}

/// Write a complete BVH document.
///
/// `frames` is the kept frame set; it must not be empty - the writer
/// aborts before emitting a `MOTION` block otherwise, and the caller is
/// expected to discard the partial output.
pub fn write_bvh<W: Write>(
    w: &mut W,
    skel: &Skeleton,
    channels: &ChannelSet,
    motion: &SampledMotion,
    frames: &BTreeSet<i32>,
    opts: &BvhOptions,
) -> Result<(), BvhError> {
    if !skel.contains(rig::PELVIS) {
        return Err(BvhError::MissingRoot(rig::PELVIS));
    }
    let root = build_joint(skel, channels, rig::PELVIS, DVec3::ZERO)
        .ok_or(BvhError::MissingRoot(rig::PELVIS))?;
    let rest_root = skel.rest_head_world(rig::PELVIS).unwrap_or(DVec3::ZERO);

    writeln!(w, "HIERARCHY").map_err(BvhError::Io)?;
    write_joint(w, &root, 0, true)?;

    if frames.is_empty() {
        return Err(BvhError::NoFrames);
    }

    let frame_count = frames.len() + usize::from(opts.reference_line.is_some());
    writeln!(w, "MOTION")?;
    writeln!(w, "Frames: {frame_count}")?;
    writeln!(w, "Frame Time: {:.6}", 1.0 / opts.fps)?;

    match opts.reference_line {
        Some(ReferenceLine::Frozen) => {
            let mut values = Vec::new();
            push_frozen_values(&root, true, rest_root, &mut values);
            write_line(w, &values)?;
        }
        Some(ReferenceLine::BoneLock) => {
            let mut values = Vec::new();
            push_line_values(&root, true, motion, opts.reference_frame, rest_root, &mut values);
            for v in &mut values {
                // lock rule: near-rest channels read as restpose
                if v.abs() < opts.lock_threshold {
                    *v = 0.0;
                }
            }
            write_line(w, &values)?;
        }
        None => {}
    }

    for &frame in frames {
        let mut values = Vec::new();
        push_line_values(&root, true, motion, frame, rest_root, &mut values);
        write_line(w, &values)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::FrameSample;
    use crate::skeleton::Bone;

    fn test_rig() -> (Skeleton, ChannelSet) {
        let mut skel = Skeleton::new();
        skel.add_bone(Bone::new(
            "mPelvis",
            None,
            DVec3::new(0.0, 0.0, 1.0),
            DVec3::new(0.0, 0.0, 1.1),
        ))
        .unwrap();
        skel.add_bone(Bone::new(
            "mTorso",
            Some(0),
            DVec3::new(0.0, 0.0, 0.1),
            DVec3::new(0.0, 0.0, 0.3),
        ))
        .unwrap();
        let mut channels = ChannelSet::new();
        channels.add_loc("mPelvis");
        channels.add_rot("mPelvis");
        channels.add_rot("mTorso");
        (skel, channels)
    }

    fn identity_sample(z: f64) -> FrameSample {
        let pose = DMat4::from_translation(DVec3::new(0.0, 0.0, z));
        FrameSample {
            visual: DMat4::IDENTITY,
            parent_pose: DMat4::IDENTITY,
            pose,
        }
    }

    #[test]
    fn test_hierarchy_tokens() {
        let (skel, channels) = test_rig();
        let mut motion = SampledMotion::new();
        motion.insert(0, "mPelvis", identity_sample(1.0));
        motion.insert(0, "mTorso", identity_sample(1.1));
        let frames: BTreeSet<i32> = [0].into_iter().collect();

        let mut out = Vec::new();
        write_bvh(&mut out, &skel, &channels, &motion, &frames, &BvhOptions::default()).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HIERARCHY\nROOT hip\n"));
        assert!(text.contains("JOINT abdomen"));
        assert!(text.contains(
            "CHANNELS 6 Xposition Yposition Zposition Xrotation Yrotation Zrotation"
        ));
        assert!(text.contains("CHANNELS 3 Xrotation Yrotation Zrotation"));
        assert!(text.contains("End Site"));
        assert!(text.contains("MOTION\nFrames: 1\n"));
        assert!(text.contains("Frame Time: 0.041667"));
    }

    #[test]
    fn test_zero_frames_aborts_before_motion_block() {
        let (skel, channels) = test_rig();
        let motion = SampledMotion::new();
        let frames = BTreeSet::new();

        let mut out = Vec::new();
        let err = write_bvh(&mut out, &skel, &channels, &motion, &frames, &BvhOptions::default())
            .unwrap_err();
        assert!(matches!(err, BvhError::NoFrames));
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("MOTION"), "no MOTION block may be emitted");
        assert!(!text.contains("Frames: 0"));
    }

    #[test]
    fn test_reference_line_adds_one_frame() {
        let (skel, channels) = test_rig();
        let mut motion = SampledMotion::new();
        motion.insert(0, "mPelvis", identity_sample(1.0));
        motion.insert(0, "mTorso", identity_sample(1.1));
        let frames: BTreeSet<i32> = [0].into_iter().collect();

        let opts = BvhOptions {
            reference_line: Some(ReferenceLine::Frozen),
            ..BvhOptions::default()
        };
        let mut out = Vec::new();
        write_bvh(&mut out, &skel, &channels, &motion, &frames, &opts).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Frames: 2"));

        // the frozen line holds the root at rest height (1m up, Y in BVH)
        let motion_lines: Vec<&str> = text
            .lines()
            .skip_while(|l| !l.starts_with("Frame Time:"))
            .skip(1)
            .collect();
        assert_eq!(motion_lines.len(), 2);
        let first: Vec<f64> = motion_lines[0]
            .split(' ')
            .map(|v| v.parse().unwrap())
            .collect();
        assert!((first[1] - 1.0 / INCH_TO_METER).abs() < 0.01);
        assert!(first[3..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_rotation_only_joint_omits_offset_triple() {
        let (skel, channels) = test_rig();
        let mut motion = SampledMotion::new();
        motion.insert(0, "mPelvis", identity_sample(1.0));
        motion.insert(0, "mTorso", identity_sample(1.1));
        let frames: BTreeSet<i32> = [0].into_iter().collect();

        let mut out = Vec::new();
        write_bvh(&mut out, &skel, &channels, &motion, &frames, &BvhOptions::default()).unwrap();
        let text = String::from_utf8(out).unwrap();
        // 6 root channels + 3 torso channels per line
        let line = text.lines().last().unwrap();
        assert_eq!(line.split(' ').count(), 9);
    }

    #[test]
    fn test_missing_root_bone_is_fatal() {
        let mut skel = Skeleton::new();
        skel.add_bone(Bone::new("mTorso", None, DVec3::ZERO, DVec3::Z))
            .unwrap();
        let channels = ChannelSet::new();
        let err = write_bvh(
            &mut Vec::new(),
            &skel,
            &channels,
            &SampledMotion::new(),
            &BTreeSet::new(),
            &BvhOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BvhError::MissingRoot(_)));
    }
}
