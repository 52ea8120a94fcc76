//! Avatar rig naming conventions
//!
//! The legacy avatar skeleton encodes a lot of meaning in bone names:
//! deform bones carry an `m` prefix, control bones use `ik`/`a` prefixes,
//! and the BVH consumer expects its own historical joint names. All of
//! those rules live here as data so the collector and the serializers
//! stay convention-free.

use hashbrown::HashMap;

/// Prefix of deform bones (`mPelvis`, `mTorso`, ...).
pub const DEFORM_PREFIX: &str = "m";

/// The skeleton's pelvis deform bone.
pub const PELVIS: &str = "mPelvis";

/// The torso deform bone, forced by the inverse-pelvis alias.
pub const TORSO: &str = "mTorso";

/// Legacy root aliases that stand in for the pelvis.
pub const ROOT_ALIASES: &[&str] = &["Origin", "COG"];

/// Inverse-pelvis helper; keys on it move the body around the pelvis.
pub const PELVIS_INV: &str = "PelvisInv";

/// Fixed name of the synthetic BVH root joint.
pub const BVH_ROOT: &str = "hip";

/// Hand roots; every finger chain hangs below one of these.
pub const HAND_ROOTS: &[&str] = &["mWristLeft", "mWristRight"];

/// IK handle bone and the deform chain it controls, root first.
pub struct IkChain {
    pub target: &'static str,
    pub chain_root: &'static str,
}

/// The four limb IK chains.
pub const IK_CHAINS: &[IkChain] = &[
    IkChain { target: "ikWristLeft", chain_root: "mShoulderLeft" },
    IkChain { target: "ikWristRight", chain_root: "mShoulderRight" },
    IkChain { target: "ikAnkleLeft", chain_root: "mHipLeft" },
    IkChain { target: "ikAnkleRight", chain_root: "mHipRight" },
];

/// Eye-target control bones and the eye bones they drive. A location key
/// on the target becomes rotation channels on the eyes, never a location
/// channel on the target itself.
pub const EYE_TARGETS: &[(&str, &[&str])] =
    &[("EyeTarget", &["mEyeLeft", "mEyeRight"])];

/// Deform bones whose parent intentionally differs from what the paired
/// animation bone implies. Observed exception: thumbs parent straight to
/// the wrist.
pub const PARENT_EXCEPTIONS: &[(&str, &str)] = &[
    ("mHandThumb1Left", "mWristLeft"),
    ("mHandThumb1Right", "mWristRight"),
];

/// BVH joint names for the classic avatar skeleton. Bones missing from
/// this table are not export-eligible for the text format.
pub const BVH_NAMES: &[(&str, &str)] = &[
    ("mPelvis", "hip"),
    ("mTorso", "abdomen"),
    ("mChest", "chest"),
    ("mNeck", "neck"),
    ("mHead", "head"),
    ("mCollarLeft", "lCollar"),
    ("mShoulderLeft", "lShldr"),
    ("mElbowLeft", "lForeArm"),
    ("mWristLeft", "lHand"),
    ("mCollarRight", "rCollar"),
    ("mShoulderRight", "rShldr"),
    ("mElbowRight", "rForeArm"),
    ("mWristRight", "rHand"),
    ("mHipLeft", "lThigh"),
    ("mKneeLeft", "lShin"),
    ("mAnkleLeft", "lFoot"),
    ("mHipRight", "rThigh"),
    ("mKneeRight", "rShin"),
    ("mAnkleRight", "rFoot"),
];

/// The deform-prefixed variant of an animation bone name.
pub fn deform_name(name: &str) -> String {
    format!("{DEFORM_PREFIX}{name}")
}

/// Strip the deform prefix, if present.
pub fn anim_name(name: &str) -> Option<&str> {
    name.strip_prefix(DEFORM_PREFIX)
        .filter(|rest| rest.chars().next().is_some_and(|c| c.is_ascii_uppercase()))
}

/// Whether a name carries the deform prefix.
pub fn is_deform(name: &str) -> bool {
    anim_name(name).is_some()
}

/// Control-rig helper bones: `ik*` handles and `a*` animation rig bones.
/// These do not count when deciding where an IK chain stops.
pub fn is_auxiliary(name: &str) -> bool {
    if name.starts_with("ik") {
        return true;
    }
    name.strip_prefix('a')
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_uppercase())
}

/// Finger bones live on the `mHand*` chains below the wrists.
pub fn is_finger(name: &str) -> bool {
    name.starts_with("mHand")
}

/// Eye bones driven by a given eye-target bone, if any.
pub fn eye_targets_of(name: &str) -> Option<&'static [&'static str]> {
    EYE_TARGETS
        .iter()
        .find(|(target, _)| *target == name)
        .map(|(_, eyes)| *eyes)
}

/// BVH joint name for a deform bone, if the bone is export-eligible.
pub fn bvh_name(bone: &str) -> Option<&'static str> {
    BVH_NAMES
        .iter()
        .find(|(deform, _)| *deform == bone)
        .map(|(_, joint)| *joint)
}

/// Expected deform parent of a deform bone, derived from its animation
/// pair's parent plus the known exception table and any run overrides.
///
/// `anim_parent` is the parent of the paired animation bone, without the
/// deform prefix.
pub fn expected_deform_parent(
    bone: &str,
    anim_parent: Option<&str>,
    overrides: &HashMap<String, String>,
) -> Option<String> {
    if let Some(parent) = overrides.get(bone) {
        return Some(parent.clone());
    }
    if let Some((_, parent)) = PARENT_EXCEPTIONS.iter().find(|(b, _)| *b == bone) {
        return Some((*parent).to_string());
    }
    anim_parent.map(deform_name)
}
