//! Cross-skeleton retargeting
//!
//! Re-expresses motion authored on a source skeleton as equivalent motion
//! on a differently-proportioned target. One rigid offset per mapped bone
//! pair and one global re-centering offset are computed from a reference
//! configuration (a chosen frame, or both rigs forced into rest pose);
//! per-frame samples are then collected, optionally loop-blended and
//! simplified, and finally written back as keyframes on the target.
//!
//! A session walks a fixed phase sequence - Idle, ReferenceAligned,
//! MotionCollected, Simplified, then back to Idle after the transfer -
//! and refuses calls out of order.

use glam::{DMat4, DQuat, DVec3};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};

use motion_common::simplify::{simplify_pinned, CurvePoint, Features};
use motion_common::skeleton::Skeleton;

use crate::clip::{Action, Key};
use crate::config::Simplification;
use crate::evaluate::{ConstraintGuard, FrameGuard, PoseEvaluator, RestPoseGuard};
use crate::export::ExportReport;

/// Source-to-target bone name mapping plus the designated center pair
/// used for global alignment.
#[derive(Debug, Clone)]
pub struct BoneMap {
    pairs: Vec<(String, String)>,
    by_source: HashMap<String, String>,
    /// (source center bone, target center bone)
    pub center: (String, String),
}

impl BoneMap {
    pub fn new(center_source: &str, center_target: &str) -> Self {
        let mut map = Self {
            pairs: Vec::new(),
            by_source: HashMap::new(),
            center: (center_source.to_string(), center_target.to_string()),
        };
        map.insert(center_source, center_target);
        map
    }

    /// Map a source bone onto a target bone. Re-inserting a source bone
    /// replaces its target.
    pub fn insert(&mut self, source: &str, target: &str) {
        if let Some(existing) = self.by_source.get_mut(source) {
            *existing = target.to_string();
            for pair in &mut self.pairs {
                if pair.0 == source {
                    pair.1 = target.to_string();
                }
            }
            return;
        }
        self.by_source
            .insert(source.to_string(), target.to_string());
        self.pairs.push((source.to_string(), target.to_string()));
    }

    pub fn map(&self, source: &str) -> Option<&str> {
        self.by_source.get(source).map(String::as_str)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

#[derive(Debug, Clone)]
pub struct RetargetOptions {
    /// Frame the alignment offsets are computed at; never collected
    pub reference_frame: Option<i32>,
    /// Align in forced rest pose instead of at a reference frame
    pub use_restpose: bool,
    pub with_translation: bool,
    pub simplification: Simplification,
    pub tolerance: f64,
    pub seamless_loc_frames: u32,
    pub seamless_rot_frames: u32,
    pub frame_start: i32,
    pub frame_end: i32,
    /// Frames pinned through simplification (loop markers etc.)
    pub pinned: BTreeSet<i32>,
}

impl Default for RetargetOptions {
    fn default() -> Self {
        Self {
            reference_frame: None,
            use_restpose: true,
            with_translation: false,
            simplification: Simplification::PerChannel,
            tolerance: 0.01,
            seamless_loc_frames: 0,
            seamless_rot_frames: 0,
            frame_start: 0,
            frame_end: 0,
            pinned: BTreeSet::new(),
        }
    }
}

/// One target bone driven from a source bone.
#[derive(Debug, Clone)]
pub struct RetargetChannel {
    pub source: String,
    pub target: String,
    pub has_translation: bool,
    /// Rigid bind-pose difference between the pair, computed once
    pub offset: DMat4,
    /// frame -> (location, rotation), world space, center-adjusted
    pub frames: BTreeMap<i32, (DVec3, DQuat)>,
    /// Kept frames after simplification
    pub simplified: Option<BTreeSet<i32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    ReferenceAligned,
    MotionCollected,
    Simplified,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::ReferenceAligned => "ReferenceAligned",
            Phase::MotionCollected => "MotionCollected",
            Phase::Simplified => "Simplified",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetargetError {
    #[error("retarget session is {actual}, expected {expected}")]
    WrongPhase {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("center bone '{0}' cannot be evaluated")]
    MissingCenter(String),
}

/// Run a closure with the evaluator put into the reference configuration:
/// forced rest pose, or the cursor moved to the reference frame. Either
/// way the previous state is restored when the closure returns.
fn at_reference<T>(
    eval: &mut dyn PoseEvaluator,
    use_restpose: bool,
    frame: i32,
    f: impl FnOnce(&mut dyn PoseEvaluator) -> T,
) -> T {
    if use_restpose {
        let mut guard = RestPoseGuard::new(eval, true);
        f(&mut *guard)
    } else {
        let mut guard = FrameGuard::new(eval);
        guard.set_current_frame(frame);
        f(&mut *guard)
    }
}

pub struct RetargetSession {
    map: BoneMap,
    opts: RetargetOptions,
    phase: Phase,
    /// Global re-centering offset from the center bone pair
    goffset: DVec3,
    channels: Vec<RetargetChannel>,
}

impl RetargetSession {
    pub fn new(map: BoneMap, opts: RetargetOptions) -> Self {
        Self {
            map,
            opts,
            phase: Phase::Idle,
            goffset: DVec3::ZERO,
            channels: Vec::new(),
        }
    }

    fn ensure(&self, want: Phase) -> Result<(), RetargetError> {
        if self.phase == want {
            Ok(())
        } else {
            Err(RetargetError::WrongPhase {
                expected: want.name(),
                actual: self.phase.name(),
            })
        }
    }

    pub fn channels(&self) -> &[RetargetChannel] {
        &self.channels
    }

    pub fn goffset(&self) -> DVec3 {
        self.goffset
    }

    /// Compute the global offset and the per-pair rigid offsets from the
    /// reference configuration. Unknown bones in the mapping are skipped
    /// into the report, not fatal.
    pub fn align_reference(
        &mut self,
        source: &mut dyn PoseEvaluator,
        source_skel: &Skeleton,
        target: &mut dyn PoseEvaluator,
        target_skel: &Skeleton,
        report: &mut ExportReport,
    ) -> Result<(), RetargetError> {
        self.ensure(Phase::Idle)?;
        let frame = self.opts.reference_frame.unwrap_or(self.opts.frame_start);
        let use_rest = self.opts.use_restpose;

        let center_src = self.map.center.0.clone();
        let center_tgt = self.map.center.1.clone();

        let src_center = at_reference(source, use_rest, frame, |e| e.world_pose(&center_src))
            .ok_or_else(|| RetargetError::MissingCenter(center_src.clone()))?;
        let tgt_center = at_reference(target, use_rest, frame, |e| e.world_pose(&center_tgt))
            .ok_or_else(|| RetargetError::MissingCenter(center_tgt.clone()))?;
        let src_center_world = source_skel.world * src_center;
        let tgt_center_world = target_skel.world * tgt_center;

        // translation difference between the centers, re-expressed in the
        // target center's own frame
        let diff = src_center_world.w_axis.truncate() - tgt_center_world.w_axis.truncate();
        let (_, tgt_rot, _) = tgt_center_world.to_scale_rotation_translation();
        self.goffset = tgt_rot.inverse() * diff;

        self.channels.clear();
        for (src, tgt) in self.map.pairs() {
            let (Some(src_bind), Some(tgt_bind)) = (source.bind_local(src), target.bind_local(tgt))
            else {
                tracing::debug!("skipping unmapped bone-store entry '{src}' -> '{tgt}'");
                report.skipped_entries.push(src.clone());
                continue;
            };
            let offset = (target_skel.world * tgt_bind).inverse() * (source_skel.world * src_bind);
            let has_translation = self.opts.with_translation || *tgt == center_tgt;
            self.channels.push(RetargetChannel {
                source: src.clone(),
                target: tgt.clone(),
                has_translation,
                offset,
                frames: BTreeMap::new(),
                simplified: None,
            });
        }

        self.phase = Phase::ReferenceAligned;
        Ok(())
    }

    /// Evaluate the source over the frame range and store per-channel
    /// (location, rotation) samples. The reference frame itself is never
    /// collected.
    pub fn collect_motion(
        &mut self,
        source: &mut dyn PoseEvaluator,
        source_skel: &Skeleton,
    ) -> Result<(), RetargetError> {
        self.ensure(Phase::ReferenceAligned)?;
        let center_tgt = self.map.center.1.clone();
        let goffset = self.goffset;
        let reference = self.opts.reference_frame;

        let mut guard = FrameGuard::new(source);
        for frame in self.opts.frame_start..=self.opts.frame_end {
            if reference == Some(frame) {
                continue;
            }
            guard.set_current_frame(frame);
            for ch in &mut self.channels {
                let Some(pose) = guard.world_pose(&ch.source) else {
                    continue;
                };
                let world = source_skel.world * pose;
                // the center carries root motion: re-center it against the
                // target's bind pose before decomposing
                let m = if ch.target == center_tgt {
                    DMat4::from_translation(goffset) * (world * ch.offset)
                } else {
                    world
                };
                let (_, rot, loc) = m.to_scale_rotation_translation();
                ch.frames.insert(frame, (loc, rot.normalize()));
            }
        }

        self.phase = Phase::MotionCollected;
        Ok(())
    }

    /// Loop-blend the channel tails, then reduce keys per the configured
    /// policy.
    pub fn simplify(&mut self) -> Result<(), RetargetError> {
        self.ensure(Phase::MotionCollected)?;
        let (loc_n, rot_n) = (self.opts.seamless_loc_frames, self.opts.seamless_rot_frames);
        for ch in &mut self.channels {
            make_seamless(ch, loc_n, rot_n);
        }

        match self.opts.simplification {
            Simplification::None => {
                for ch in &mut self.channels {
                    ch.simplified = Some(ch.frames.keys().copied().collect());
                }
            }
            Simplification::PerChannel => {
                for ch in &mut self.channels {
                    let points: Vec<CurvePoint> = ch
                        .frames
                        .iter()
                        .map(|(&frame, (loc, rot))| {
                            let mut features = Features::new();
                            features.extend([rot.x, rot.y, rot.z, rot.w]);
                            if ch.has_translation {
                                features.extend([loc.x, loc.y, loc.z]);
                            }
                            CurvePoint { frame, features }
                        })
                        .collect();
                    ch.simplified =
                        Some(simplify_pinned(&points, self.opts.tolerance, &self.opts.pinned));
                }
            }
            Simplification::Global => {
                let frames: BTreeSet<i32> = self
                    .channels
                    .iter()
                    .flat_map(|ch| ch.frames.keys().copied())
                    .collect();
                let points: Vec<CurvePoint> = frames
                    .iter()
                    .map(|&frame| {
                        let mut features = Features::new();
                        for ch in &self.channels {
                            match ch.frames.get(&frame) {
                                Some((loc, rot)) => {
                                    features.extend([rot.x, rot.y, rot.z, rot.w]);
                                    features.extend([loc.x, loc.y, loc.z]);
                                }
                                None => features.extend([0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]),
                            }
                        }
                        CurvePoint { frame, features }
                    })
                    .collect();
                let kept = simplify_pinned(&points, self.opts.tolerance, &self.opts.pinned);
                for ch in &mut self.channels {
                    ch.simplified = Some(kept.clone());
                }
            }
        }

        self.phase = Phase::Simplified;
        Ok(())
    }

    /// Drive the target skeleton from the collected samples and return
    /// the keyframed action. Target constraints are suspended for the
    /// duration; the session returns to Idle and its channels are
    /// discarded.
    pub fn transfer(
        &mut self,
        target: &mut dyn PoseEvaluator,
        target_skel: &Skeleton,
    ) -> Result<Action, RetargetError> {
        self.ensure(Phase::Simplified)?;
        let center_tgt = self.map.center.1.clone();
        let world_inv = target_skel.world.inverse();

        // joint limits must not clip retargeted values mid-transfer
        let guard = ConstraintGuard::suspend(target);

        // target bones in hierarchy order so parent worlds exist before
        // their children are resolved
        let mut order: Vec<(usize, usize)> = self
            .channels
            .iter()
            .enumerate()
            .filter_map(|(ci, ch)| target_skel.index(&ch.target).map(|bi| (bi, ci)))
            .collect();
        order.sort_unstable();

        let frames: BTreeSet<i32> = self
            .channels
            .iter()
            .flat_map(|ch| ch.frames.keys().copied())
            .collect();

        let mut rot_keys: HashMap<String, Vec<Key<DQuat>>> = HashMap::new();
        let mut loc_keys: HashMap<String, Vec<Key<DVec3>>> = HashMap::new();

        for &frame in &frames {
            let mut world: HashMap<usize, DMat4> = HashMap::new();
            for &(bone_idx, ch_idx) in &order {
                let ch = &self.channels[ch_idx];
                let Some((loc, rot)) = ch.frames.get(&frame) else {
                    continue;
                };
                let sample_world = DMat4::from_rotation_translation(*rot, *loc);
                // the center was bind-aligned at collection time; every
                // other pair applies its rigid offset here
                let desired = if ch.target == center_tgt {
                    world_inv * sample_world
                } else {
                    world_inv * (sample_world * ch.offset.inverse())
                };
                let parent_world = match target_skel.bones()[bone_idx].parent {
                    Some(p) => world.get(&p).copied().or_else(|| {
                        // undriven ancestors hold their rest chain
                        guard.rest_local(&target_skel.bones()[p].name)
                    }),
                    None => Some(DMat4::IDENTITY),
                };
                let Some(parent_world) = parent_world else {
                    continue;
                };
                world.insert(bone_idx, desired);

                let keep = ch
                    .simplified
                    .as_ref()
                    .is_none_or(|kept| kept.contains(&frame));
                if !keep {
                    continue;
                }
                let local = parent_world.inverse() * desired;
                let (_, q, t) = local.to_scale_rotation_translation();
                rot_keys.entry(ch.target.clone()).or_default().push(Key {
                    frame: f64::from(frame),
                    value: q.normalize(),
                });
                if ch.has_translation {
                    loc_keys.entry(ch.target.clone()).or_default().push(Key {
                        frame: f64::from(frame),
                        value: t,
                    });
                }
            }
        }
        drop(guard);

        let mut action = Action::new("retargeted");
        for &(_, ch_idx) in &order {
            let target_name = &self.channels[ch_idx].target;
            if let Some(keys) = rot_keys.remove(target_name) {
                action.push_rotation(target_name, keys);
            }
            if let Some(keys) = loc_keys.remove(target_name) {
                action.push_location(target_name, keys);
            }
        }

        self.channels.clear();
        self.phase = Phase::Idle;
        Ok(action)
    }
}

/// Blend the last `loc_n` location samples and `rot_n` rotation samples
/// of a channel toward its first sample so the clip loops without a jump.
/// The final sample is assigned the first sample's value exactly.
fn make_seamless(ch: &mut RetargetChannel, loc_n: u32, rot_n: u32) {
    let frames: Vec<i32> = ch.frames.keys().copied().collect();
    let Some(&first) = frames.first() else {
        return;
    };
    let (first_loc, first_rot) = ch.frames[&first];
    let n = frames.len();

    let loc_count = (loc_n as usize).min(n.saturating_sub(1));
    for (i, f) in frames[n - loc_count..].iter().enumerate() {
        let t = (i + 1) as f64 / loc_count as f64;
        if let Some(entry) = ch.frames.get_mut(f) {
            entry.0 = if t >= 1.0 {
                first_loc
            } else {
                entry.0.lerp(first_loc, t)
            };
        }
    }

    let rot_count = (rot_n as usize).min(n.saturating_sub(1));
    for (i, f) in frames[n - rot_count..].iter().enumerate() {
        let t = (i + 1) as f64 / rot_count as f64;
        if let Some(entry) = ch.frames.get_mut(f) {
            entry.1 = if t >= 1.0 {
                first_rot
            } else {
                entry.1.slerp(first_rot, t).normalize()
            };
        }
    }
}
