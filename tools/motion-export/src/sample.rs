//! Per-frame pose sampling
//!
//! For every requested frame the evaluator's shared cursor is advanced
//! (whole-skeleton re-evaluation, so frames go strictly in order), then
//! each channel bone's visual delta is computed: what the animator posed
//! on top of rest, with any constraint/IK influence baked in but the
//! coordinate-frame effects removed. A retargeted skeleton with
//! different proportions can replay these deltas standalone.

use glam::{DMat4, DQuat};

use motion_common::motion::{ChannelSet, FrameSample, SampledMotion};
use motion_common::skeleton::Skeleton;

use crate::evaluate::{FrameGuard, PoseEvaluator};
use crate::export::{ExportReport, ProgressCounter};

/// Why one (frame, bone) sample could not be produced. Individual
/// failures degrade the export; they never abort it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SampleError {
    #[error("bone '{0}' has no rest matrix")]
    NoRestMatrix(String),

    #[error("bone '{bone}' has no evaluated pose at frame {frame}")]
    NoPose { bone: String, frame: i32 },
}

/// One bone's visual delta at the evaluator's current frame.
fn sample_bone<E: PoseEvaluator + ?Sized>(
    eval: &mut E,
    skel: &Skeleton,
    bone: &str,
    frame: i32,
) -> Result<FrameSample, SampleError> {
    let rest_bone = eval
        .rest_local(bone)
        .ok_or_else(|| SampleError::NoRestMatrix(bone.to_string()))?;
    let pose = eval.world_pose(bone).ok_or_else(|| SampleError::NoPose {
        bone: bone.to_string(),
        frame,
    })?;

    let (rest_parent, pose_parent) = match skel.parent_of(bone) {
        Some(parent) => {
            let rest = eval
                .rest_local(&parent.name)
                .ok_or_else(|| SampleError::NoRestMatrix(parent.name.clone()))?;
            let pose = eval
                .world_pose(&parent.name)
                .ok_or_else(|| SampleError::NoPose {
                    bone: parent.name.clone(),
                    frame,
                })?;
            (rest, pose)
        }
        None => (DMat4::IDENTITY, DMat4::IDENTITY),
    };

    // the bone's rest transform relative to its parent...
    let rest_rel = rest_parent.inverse() * rest_bone;
    // ...undone against the evaluated pose gives the pure animator delta
    let delta = rest_rel.inverse() * (pose_parent.inverse() * pose);
    // re-express in the bone's rest orientation so rolls cancel out
    let basis = DMat4::from_quat(DQuat::from_mat4(&rest_bone).normalize());
    let visual = basis * delta * basis.inverse();

    Ok(FrameSample {
        visual,
        parent_pose: pose_parent,
        pose,
    })
}

/// Sample every channel bone over a frame range.
///
/// The evaluator's cursor is guarded: whatever frame the host was on
/// before the call is restored when sampling ends, on every exit path.
/// Per-bone failures are logged into the report and that sample is
/// omitted.
pub fn sample_range<E: PoseEvaluator + ?Sized>(
    eval: &mut E,
    skel: &Skeleton,
    channels: &ChannelSet,
    frames: impl IntoIterator<Item = i32>,
    report: &mut ExportReport,
    progress: &ProgressCounter,
) -> SampledMotion {
    let mut motion = SampledMotion::new();
    let mut guard = FrameGuard::new(eval);
    for frame in frames {
        guard.set_current_frame(frame);
        for bone in channels.order() {
            match sample_bone(&mut *guard, skel, bone, frame) {
                Ok(sample) => motion.insert(frame, bone, sample),
                Err(err) => {
                    tracing::debug!("skipping sample: {err}");
                    report.missing_samples.push((frame, bone.clone()));
                }
            }
        }
        progress.advance();
    }
    motion
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{Action, ClipSource, Key};
    use crate::evaluate::ClipEvaluator;
    use glam::DVec3;
    use motion_common::skeleton::Bone;

    fn rig(action: Action) -> (ClipEvaluator, ChannelSet) {
        let mut skel = Skeleton::new();
        skel.add_bone(Bone::new("mPelvis", None, DVec3::new(0.0, 0.0, 1.0), DVec3::new(0.0, 0.0, 1.1)))
            .unwrap();
        skel.add_bone(Bone::new(
            "mTorso",
            Some(0),
            DVec3::new(0.0, 0.0, 0.1),
            DVec3::new(0.0, 0.0, 0.3),
        ))
        .unwrap();
        let mut channels = ChannelSet::new();
        channels.add_rot("mPelvis");
        channels.add_rot("mTorso");
        (ClipEvaluator::new(skel, ClipSource::from_action(action)), channels)
    }

    #[test]
    fn test_rest_pose_samples_identity_visual() {
        let (mut eval, channels) = rig(Action::new("empty"));
        let skel = eval.skeleton().clone();
        let mut report = ExportReport::default();
        let progress = ProgressCounter::default();
        let motion = sample_range(&mut eval, &skel, &channels, 0..3, &mut report, &progress);

        for frame in 0..3 {
            let sample = motion.get(frame, "mTorso").unwrap();
            let diff = sample.visual - DMat4::IDENTITY;
            assert!(
                diff.to_cols_array().iter().all(|v| v.abs() < 1e-9),
                "frame {frame} visual is not identity"
            );
        }
        assert!(report.missing_samples.is_empty());
        assert_eq!(progress.get(), 3);
    }

    #[test]
    fn test_keyed_rotation_appears_in_visual() {
        let mut action = Action::new("bend");
        let half = DQuat::from_rotation_x(0.4);
        action.push_rotation("mTorso", vec![Key { frame: 0.0, value: half }]);
        let (mut eval, channels) = rig(action);
        let skel = eval.skeleton().clone();
        let mut report = ExportReport::default();
        let progress = ProgressCounter::default();
        let motion = sample_range(&mut eval, &skel, &channels, 0..1, &mut report, &progress);

        let sample = motion.get(0, "mTorso").unwrap();
        let q = DQuat::from_mat4(&sample.visual).normalize();
        assert!(q.dot(half).abs() > 0.999999, "visual rotation {q:?}");
    }

    #[test]
    fn test_missing_bone_degrades_gracefully() {
        let (mut eval, mut channels) = rig(Action::new("empty"));
        channels.add_rot("mGhost");
        let skel = eval.skeleton().clone();
        let mut report = ExportReport::default();
        let progress = ProgressCounter::default();
        let motion = sample_range(&mut eval, &skel, &channels, 0..2, &mut report, &progress);

        assert!(motion.get(0, "mGhost").is_none());
        assert!(motion.get(0, "mTorso").is_some());
        assert_eq!(report.missing_samples.len(), 2);
    }

    #[test]
    fn test_cursor_restored_after_sampling() {
        let (mut eval, channels) = rig(Action::new("empty"));
        let skel = eval.skeleton().clone();
        eval.set_current_frame(42);
        let mut report = ExportReport::default();
        let progress = ProgressCounter::default();
        let _ = sample_range(&mut eval, &skel, &channels, 0..5, &mut report, &progress);
        assert_eq!(eval.current_frame(), 42);
    }
}
