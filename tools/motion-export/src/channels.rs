//! Channel collection
//!
//! Scans a clip's keyed curves and decides, per bone, whether rotation
//! and/or translation channels go into the export. Legacy aliases, eye
//! targets, deform-prefix fallback and the driver graph all resolve
//! here; a second pass pulls in IK limb chains and finger chains. Every
//! touched bone gets its rest metadata cached exactly once.

use hashbrown::{HashMap, HashSet};

use motion_common::motion::ChannelSet;
use motion_common::rig;
use motion_common::skeleton::{BoneRestInfo, Skeleton};

use crate::clip::{ClipSource, CurveKind};
use crate::evaluate::PoseEvaluator;
use crate::export::ExportReport;

/// Hard limit the binary consumer enforces on exported bones.
pub const MAX_EXPORT_BONES: usize = 32;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectError {
    /// More animated bones than the consumer accepts; the export must not
    /// proceed
    #[error("{count} animated bones exceed the export limit of {MAX_EXPORT_BONES}")]
    TooManyBones { count: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct CollectOptions {
    /// Export translation channels beyond the pelvis
    pub with_translation: bool,
    /// Populate rest metadata from bind matrices instead of rest matrices
    pub use_bind_pose: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            with_translation: false,
            use_bind_pose: true,
        }
    }
}

/// Driver/driven relationships between bones, built once by scanning
/// every bone's constraint targets. Queried, never mutated.
#[derive(Debug, Clone, Default)]
pub struct DriverGraph {
    drives: HashMap<String, Vec<String>>,
    driven_by: HashMap<String, Vec<String>>,
}

impl DriverGraph {
    pub fn build(skel: &Skeleton) -> Self {
        let mut graph = Self::default();
        for bone in skel.bones() {
            for target in &bone.constraint_targets {
                if !skel.contains(target) {
                    continue; // cross-armature target, not ours
                }
                graph
                    .drives
                    .entry(target.clone())
                    .or_default()
                    .push(bone.name.clone());
                graph
                    .driven_by
                    .entry(bone.name.clone())
                    .or_default()
                    .push(target.clone());
            }
        }
        graph
    }

    pub fn drives(&self, bone: &str) -> &[String] {
        self.drives.get(bone).map_or(&[], Vec::as_slice)
    }

    pub fn driven_by(&self, bone: &str) -> &[String] {
        self.driven_by.get(bone).map_or(&[], Vec::as_slice)
    }

    /// Every bone this bone drives, transitively, in breadth-first order.
    pub fn drives_transitive(&self, bone: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(bone);
        let mut queue: Vec<&str> = vec![bone];
        let mut out = Vec::new();
        while let Some(cur) = queue.pop() {
            for driven in self.drives(cur) {
                if seen.insert(driven.as_str()) {
                    out.push(driven.clone());
                    queue.push(driven.as_str());
                }
            }
        }
        out
    }
}

/// Cache rest metadata for a bone, first value wins.
fn populate_rest_info<E: PoseEvaluator + ?Sized>(
    channels: &mut ChannelSet,
    skel: &Skeleton,
    eval: &E,
    opts: &CollectOptions,
    name: &str,
) {
    if channels.has_rest_info(name) {
        return;
    }
    let matrix_of = |bone: &str| {
        if opts.use_bind_pose {
            eval.bind_local(bone)
        } else {
            eval.rest_local(bone)
        }
    };
    let Some(m_bone) = matrix_of(name) else {
        return;
    };
    let m_parent = skel
        .parent_of(name)
        .and_then(|p| matrix_of(&p.name))
        .unwrap_or(glam::DMat4::IDENTITY);
    let rel = m_parent.inverse() * m_bone;
    let (_, rot0, offset0) = rel.to_scale_rotation_translation();
    let (pscale0, _, _) = m_parent.to_scale_rotation_translation();
    channels.put_rest_info(name, BoneRestInfo { rot0, pscale0, offset0 });
}

/// The "hierarchy changed" translation heuristic: a deform bone whose
/// skeleton parent differs from what its paired animation bone implies
/// needs location keys to land where the animator put it. Checked only
/// for deform-prefixed names; the expected parent comes from the
/// convention table plus run overrides.
fn hierarchy_changed(
    skel: &Skeleton,
    bone: &str,
    overrides: &HashMap<String, String>,
) -> bool {
    let Some(anim) = rig::anim_name(bone) else {
        return false;
    };
    let Some(actual) = skel.parent_of(bone).map(|p| p.name.clone()) else {
        return false;
    };
    let anim_parent = skel
        .parent_of(anim)
        .map(|p| rig::anim_name(&p.name).unwrap_or(&p.name).to_string());
    match rig::expected_deform_parent(bone, anim_parent.as_deref(), overrides) {
        Some(expected) => actual != expected,
        None => false,
    }
}

/// Resolve a curve's bone name against the skeleton, falling back to the
/// deform-prefixed variant.
fn resolve_bone(skel: &Skeleton, name: &str) -> Option<String> {
    if skel.contains(name) {
        return Some(name.to_string());
    }
    let deform = rig::deform_name(name);
    skel.contains(&deform).then_some(deform)
}

/// Collect the rotation/translation channel sets for a clip.
pub fn collect_channels<E: PoseEvaluator + ?Sized>(
    skel: &Skeleton,
    clip: &ClipSource,
    eval: &E,
    opts: &CollectOptions,
    parent_overrides: &HashMap<String, String>,
    report: &mut ExportReport,
) -> Result<ChannelSet, CollectError> {
    let graph = DriverGraph::build(skel);
    let mut channels = ChannelSet::new();
    let mut curve_bones: HashSet<&str> = HashSet::new();

    for curve in clip.curves() {
        curve_bones.insert(curve.bone.as_str());

        let mut name = curve.bone.as_str();
        if rig::ROOT_ALIASES.contains(&name) {
            name = rig::PELVIS;
        } else if name == rig::PELVIS_INV {
            // moving the body against the pelvis shows up as torso motion
            name = rig::PELVIS;
            if skel.contains(rig::TORSO) {
                channels.add_rot(rig::TORSO);
                populate_rest_info(&mut channels, skel, eval, opts, rig::TORSO);
            }
        }

        if curve.kind() == CurveKind::Location {
            if let Some(eyes) = rig::eye_targets_of(name) {
                for eye in eyes {
                    if skel.contains(eye) {
                        channels.add_rot(eye);
                        populate_rest_info(&mut channels, skel, eval, opts, eye);
                    }
                }
                continue;
            }
        }

        let Some(resolved) = resolve_bone(skel, name) else {
            tracing::warn!("curve bone '{}' not in skeleton, ignoring", curve.bone);
            report.unresolved_curves.push(curve.bone.clone());
            continue;
        };

        match curve.kind() {
            CurveKind::Rotation => {
                channels.add_rot(&resolved);
                populate_rest_info(&mut channels, skel, eval, opts, &resolved);
                if opts.with_translation && hierarchy_changed(skel, &resolved, parent_overrides) {
                    channels.add_loc(&resolved);
                }
            }
            CurveKind::Location => {
                if opts.with_translation || resolved == rig::PELVIS {
                    channels.add_loc(&resolved);
                    populate_rest_info(&mut channels, skel, eval, opts, &resolved);
                }
            }
            CurveKind::Scale => {} // never exported
            CurveKind::Influence => {
                for driven in graph.drives_transitive(&resolved) {
                    channels.add_rot(&driven);
                    populate_rest_info(&mut channels, skel, eval, opts, &driven);
                }
            }
        }
    }

    // IK-controlled limbs: any keyed or collected IK target pulls in its
    // whole deform chain
    for chain in rig::IK_CHAINS {
        if !curve_bones.contains(chain.target) && !channels.contains(chain.target) {
            continue;
        }
        let mut current = chain.chain_root.to_string();
        while skel.contains(&current) {
            channels.add_rot(&current);
            populate_rest_info(&mut channels, skel, eval, opts, &current);
            let real_children: Vec<_> = skel
                .children_of(&current)
                .into_iter()
                .filter(|b| !rig::is_auxiliary(&b.name))
                .collect();
            // the chain ends where it branches
            if real_children.len() != 1 {
                break;
            }
            current = real_children[0].name.clone();
        }
    }

    // a posed hand implies its finger chains
    for hand in rig::HAND_ROOTS {
        if !channels.contains(hand) {
            continue;
        }
        for bone in skel.descendants_of(hand) {
            if rig::is_finger(&bone.name) {
                channels.add_rot(&bone.name);
                populate_rest_info(&mut channels, skel, eval, opts, &bone.name);
            }
        }
    }

    let count = channels.len();
    if count > MAX_EXPORT_BONES {
        return Err(CollectError::TooManyBones { count });
    }

    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{Action, CurveData, FCurve, Key};
    use crate::evaluate::ClipEvaluator;
    use glam::{DQuat, DVec3};
    use motion_common::skeleton::Bone;

    fn add(skel: &mut Skeleton, name: &str, parent: Option<&str>) {
        let parent = parent.map(|p| skel.index(p).unwrap());
        skel.add_bone(Bone::new(name, parent, DVec3::new(0.0, 0.0, 0.1), DVec3::new(0.0, 0.0, 0.2)))
            .unwrap();
    }

    fn avatar() -> Skeleton {
        let mut s = Skeleton::new();
        add(&mut s, "mPelvis", None);
        add(&mut s, "mTorso", Some("mPelvis"));
        add(&mut s, "mChest", Some("mTorso"));
        add(&mut s, "mShoulderLeft", Some("mChest"));
        add(&mut s, "mElbowLeft", Some("mShoulderLeft"));
        add(&mut s, "mWristLeft", Some("mElbowLeft"));
        add(&mut s, "mHandThumb1Left", Some("mWristLeft"));
        add(&mut s, "mEyeLeft", Some("mChest"));
        add(&mut s, "mEyeRight", Some("mChest"));
        add(&mut s, "EyeTarget", Some("mChest"));
        add(&mut s, "ikWristLeft", Some("mChest"));
        s
    }

    fn rot_curve(bone: &str) -> FCurve {
        FCurve {
            bone: bone.to_string(),
            data: CurveData::Rotation(vec![Key { frame: 0.0, value: DQuat::IDENTITY }]),
        }
    }

    fn loc_curve(bone: &str) -> FCurve {
        FCurve {
            bone: bone.to_string(),
            data: CurveData::Location(vec![Key { frame: 0.0, value: DVec3::ZERO }]),
        }
    }

    fn collect(
        skel: Skeleton,
        curves: Vec<FCurve>,
        opts: CollectOptions,
    ) -> (Result<ChannelSet, CollectError>, ExportReport) {
        let mut action = Action::new("test");
        action.curves = curves;
        let clip = ClipSource::from_action(action);
        let eval = ClipEvaluator::new(skel, clip);
        let mut report = ExportReport::default();
        let result = collect_channels(
            eval.skeleton(),
            eval.clip(),
            &eval,
            &opts,
            &HashMap::new(),
            &mut report,
        );
        (result, report)
    }

    #[test]
    fn test_root_alias_remaps_to_pelvis() {
        let (res, _) = collect(avatar(), vec![loc_curve("Origin")], CollectOptions::default());
        let ch = res.unwrap();
        assert!(ch.has_loc("mPelvis"), "pelvis location is always exported");
    }

    #[test]
    fn test_inverse_pelvis_forces_torso_rotation() {
        let (res, _) = collect(avatar(), vec![rot_curve("PelvisInv")], CollectOptions::default());
        let ch = res.unwrap();
        assert!(ch.has_rot("mTorso"));
        assert!(ch.has_rot("mPelvis"));
    }

    #[test]
    fn test_eye_target_location_becomes_eye_rotations() {
        let (res, _) = collect(avatar(), vec![loc_curve("EyeTarget")], CollectOptions::default());
        let ch = res.unwrap();
        assert!(ch.has_rot("mEyeLeft") && ch.has_rot("mEyeRight"));
        assert!(!ch.has_loc("EyeTarget"));
    }

    #[test]
    fn test_deform_prefix_fallback() {
        let (res, report) =
            collect(avatar(), vec![rot_curve("Torso")], CollectOptions::default());
        let ch = res.unwrap();
        assert!(ch.has_rot("mTorso"));
        assert!(report.unresolved_curves.is_empty());
    }

    #[test]
    fn test_unknown_bone_is_reported_not_fatal() {
        let (res, report) =
            collect(avatar(), vec![rot_curve("Nonesuch")], CollectOptions::default());
        let ch = res.unwrap();
        assert!(ch.is_empty());
        assert_eq!(report.unresolved_curves, ["Nonesuch".to_string()]);
    }

    #[test]
    fn test_location_needs_translation_flag_except_pelvis() {
        let opts = CollectOptions { with_translation: false, ..Default::default() };
        let (res, _) = collect(
            avatar(),
            vec![loc_curve("mTorso"), loc_curve("mPelvis")],
            opts,
        );
        let ch = res.unwrap();
        assert!(!ch.has_loc("mTorso"));
        assert!(ch.has_loc("mPelvis"));
    }

    #[test]
    fn test_ik_target_expands_the_limb_chain() {
        let (res, _) =
            collect(avatar(), vec![loc_curve("ikWristLeft")], CollectOptions::default());
        let ch = res.unwrap();
        for bone in ["mShoulderLeft", "mElbowLeft", "mWristLeft"] {
            assert!(ch.has_rot(bone), "{bone} missing from IK chain expansion");
        }
    }

    #[test]
    fn test_posed_hand_pulls_in_fingers() {
        let (res, _) =
            collect(avatar(), vec![rot_curve("mWristLeft")], CollectOptions::default());
        let ch = res.unwrap();
        assert!(ch.has_rot("mHandThumb1Left"));
    }

    #[test]
    fn test_influence_curve_walks_driver_graph() {
        let mut skel = avatar();
        // mChest's constraint targets mTorso: torso drives chest
        let chest = skel.index("mChest").unwrap();
        let mut bones: Vec<Bone> = skel.bones().to_vec();
        bones[chest].constraint_targets.push("mTorso".to_string());
        let mut rebuilt = Skeleton::new();
        for b in bones {
            rebuilt.add_bone(b).unwrap();
        }
        let curve = FCurve {
            bone: "mTorso".to_string(),
            data: CurveData::Influence(vec![Key { frame: 0.0, value: 1.0 }]),
        };
        let (res, _) = collect(rebuilt, vec![curve], CollectOptions::default());
        let ch = res.unwrap();
        assert!(ch.has_rot("mChest"), "driven bone gets a rotation channel");
        assert!(!ch.has_rot("mTorso"), "the driver itself is not keyed");
    }

    #[test]
    fn test_bone_count_guard() {
        let mut skel = Skeleton::new();
        for i in 0..33 {
            let name = format!("mBone{i}");
            skel.add_bone(Bone::new(name, None, DVec3::ZERO, DVec3::Z)).unwrap();
        }
        let curves: Vec<FCurve> = (0..33).map(|i| rot_curve(&format!("mBone{i}"))).collect();
        let (res, _) = collect(skel, curves, CollectOptions::default());
        assert!(matches!(res, Err(CollectError::TooManyBones { count: 33 })));

        let mut skel = Skeleton::new();
        for i in 0..32 {
            let name = format!("mBone{i}");
            skel.add_bone(Bone::new(name, None, DVec3::ZERO, DVec3::Z)).unwrap();
        }
        let curves: Vec<FCurve> = (0..32).map(|i| rot_curve(&format!("mBone{i}"))).collect();
        let (res, _) = collect(skel, curves, CollectOptions::default());
        assert_eq!(res.unwrap().len(), 32);
    }

    #[test]
    fn test_rest_info_populated_for_touched_bones() {
        let (res, _) = collect(avatar(), vec![rot_curve("mTorso")], CollectOptions::default());
        let ch = res.unwrap();
        let info = ch.rest_info("mTorso").expect("rest info cached");
        assert!((info.offset0.z - 0.1).abs() < 1e-12);
    }
}
