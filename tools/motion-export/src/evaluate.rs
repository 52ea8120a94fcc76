//! Pose evaluation
//!
//! The exporter never computes poses itself; it asks a [`PoseEvaluator`].
//! The evaluator owns two pieces of shared mutable state - the current
//! frame cursor and the forced-rest-pose display mode - and every phase
//! that touches them does so through a scoped guard so the pre-call state
//! is restored on every exit path.
//!
//! [`ClipEvaluator`] is the offline implementation: it drives a skeleton
//! from a [`ClipSource`] with straightforward forward kinematics and a
//! per-frame world-matrix cache. Advancing the cursor invalidates the
//! cache, which is why frames cannot be sampled out of order.

use glam::DMat4;
use hashbrown::HashMap;
use std::ops::{Deref, DerefMut};

use motion_common::skeleton::Skeleton;

use crate::clip::ClipSource;

/// The pose source every pipeline phase runs against.
pub trait PoseEvaluator {
    /// Move the shared frame cursor; re-evaluates the whole skeleton.
    fn set_current_frame(&mut self, frame: i32);

    fn current_frame(&self) -> i32;

    /// Evaluated pose matrix of a bone in armature space, at the current
    /// frame. `None` when the bone cannot be evaluated - callers must
    /// treat that as a first-class branch, not substitute an identity.
    fn world_pose(&mut self, bone: &str) -> Option<DMat4>;

    /// Armature-space rest matrix of a bone.
    fn rest_local(&self, bone: &str) -> Option<DMat4>;

    /// Armature-space bind matrix of a bone.
    fn bind_local(&self, bone: &str) -> Option<DMat4>;

    /// Toggle forced rest pose; returns the previous state.
    fn force_rest_pose(&mut self, on: bool) -> bool;

    /// Toggle constraint/limit application; returns the previous state.
    fn set_constraints_enabled(&mut self, on: bool) -> bool;
}

/// Scoped save/restore of the frame cursor.
pub struct FrameGuard<'a, E: PoseEvaluator + ?Sized> {
    eval: &'a mut E,
    saved: i32,
}

impl<'a, E: PoseEvaluator + ?Sized> FrameGuard<'a, E> {
    pub fn new(eval: &'a mut E) -> Self {
        let saved = eval.current_frame();
        Self { eval, saved }
    }
}

impl<E: PoseEvaluator + ?Sized> Deref for FrameGuard<'_, E> {
    type Target = E;
    fn deref(&self) -> &E {
        self.eval
    }
}

impl<E: PoseEvaluator + ?Sized> DerefMut for FrameGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.eval
    }
}

impl<E: PoseEvaluator + ?Sized> Drop for FrameGuard<'_, E> {
    fn drop(&mut self) {
        self.eval.set_current_frame(self.saved);
    }
}

/// Scoped forced-rest-pose mode.
pub struct RestPoseGuard<'a, E: PoseEvaluator + ?Sized> {
    eval: &'a mut E,
    saved: bool,
}

impl<'a, E: PoseEvaluator + ?Sized> RestPoseGuard<'a, E> {
    pub fn new(eval: &'a mut E, on: bool) -> Self {
        let saved = eval.force_rest_pose(on);
        Self { eval, saved }
    }
}

impl<E: PoseEvaluator + ?Sized> Deref for RestPoseGuard<'_, E> {
    type Target = E;
    fn deref(&self) -> &E {
        self.eval
    }
}

impl<E: PoseEvaluator + ?Sized> DerefMut for RestPoseGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.eval
    }
}

impl<E: PoseEvaluator + ?Sized> Drop for RestPoseGuard<'_, E> {
    fn drop(&mut self) {
        self.eval.force_rest_pose(self.saved);
    }
}

/// Scoped constraint suspension; retarget transfer runs inside one so the
/// target rig's limits cannot clip retargeted values.
pub struct ConstraintGuard<'a, E: PoseEvaluator + ?Sized> {
    eval: &'a mut E,
    saved: bool,
}

impl<'a, E: PoseEvaluator + ?Sized> ConstraintGuard<'a, E> {
    pub fn suspend(eval: &'a mut E) -> Self {
        let saved = eval.set_constraints_enabled(false);
        Self { eval, saved }
    }
}

impl<E: PoseEvaluator + ?Sized> Deref for ConstraintGuard<'_, E> {
    type Target = E;
    fn deref(&self) -> &E {
        self.eval
    }
}

impl<E: PoseEvaluator + ?Sized> DerefMut for ConstraintGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.eval
    }
}

impl<E: PoseEvaluator + ?Sized> Drop for ConstraintGuard<'_, E> {
    fn drop(&mut self) {
        self.eval.set_constraints_enabled(self.saved);
    }
}

/// Offline curve-driven evaluator.
pub struct ClipEvaluator {
    skel: Skeleton,
    clip: ClipSource,
    frame: i32,
    rest_forced: bool,
    constraints_enabled: bool,
    /// Parent-relative rest matrices, by bone index
    local_rest: Vec<DMat4>,
    /// Armature-space rest matrices
    rest_world: Vec<DMat4>,
    /// Armature-space bind matrices
    bind_world: Vec<DMat4>,
    /// Evaluated world poses at the current frame
    cache: HashMap<usize, DMat4>,
}

impl ClipEvaluator {
    /// Evaluator over a skeleton whose bones have no roll: rest and bind
    /// locals are pure translations at the head positions.
    pub fn new(skel: Skeleton, clip: ClipSource) -> Self {
        let local_rest = skel
            .bones()
            .iter()
            .map(|b| DMat4::from_translation(b.rest_head))
            .collect();
        let local_bind = skel
            .bones()
            .iter()
            .map(|b| DMat4::from_translation(b.bind_head))
            .collect();
        Self::with_local_matrices(skel, clip, local_rest, local_bind)
    }

    /// Evaluator with explicit parent-relative rest/bind matrices (scene
    /// formats that carry full node transforms).
    pub fn with_local_matrices(
        skel: Skeleton,
        clip: ClipSource,
        local_rest: Vec<DMat4>,
        local_bind: Vec<DMat4>,
    ) -> Self {
        debug_assert_eq!(local_rest.len(), skel.len());
        debug_assert_eq!(local_bind.len(), skel.len());
        let rest_world = accumulate(&skel, &local_rest);
        let bind_world = accumulate(&skel, &local_bind);
        Self {
            skel,
            clip,
            frame: 0,
            rest_forced: false,
            constraints_enabled: true,
            local_rest,
            rest_world,
            bind_world,
            cache: HashMap::new(),
        }
    }

    pub fn skeleton(&self) -> &Skeleton {
        &self.skel
    }

    pub fn clip(&self) -> &ClipSource {
        &self.clip
    }

    /// Local pose of a bone at the current frame: curve values replace
    /// the rest transform component-wise, anything unkeyed holds rest.
    fn local_pose(&self, idx: usize) -> DMat4 {
        if self.rest_forced {
            return self.local_rest[idx];
        }
        let bone = &self.skel.bones()[idx];
        let frame = f64::from(self.frame);
        let rot = self.clip.sample_rotation(&bone.name, frame);
        let loc = self.clip.sample_location(&bone.name, frame);
        if rot.is_none() && loc.is_none() {
            return self.local_rest[idx];
        }
        let (scale, rest_rot, rest_loc) = self.local_rest[idx].to_scale_rotation_translation();
        DMat4::from_scale_rotation_translation(
            scale,
            rot.unwrap_or(rest_rot),
            loc.unwrap_or(rest_loc),
        )
    }

    fn compute_world(&mut self, idx: usize) -> DMat4 {
        if let Some(m) = self.cache.get(&idx) {
            return *m;
        }
        let parent = self.skel.bones()[idx].parent;
        let parent_world = match parent {
            Some(p) => self.compute_world(p),
            None => DMat4::IDENTITY,
        };
        let world = parent_world * self.local_pose(idx);
        self.cache.insert(idx, world);
        world
    }
}

/// Chain-multiply parent-relative matrices into armature space. Bones are
/// stored parents-first, so a single pass suffices.
fn accumulate(skel: &Skeleton, locals: &[DMat4]) -> Vec<DMat4> {
    let mut world = Vec::with_capacity(locals.len());
    for (i, bone) in skel.bones().iter().enumerate() {
        let m = match bone.parent {
            Some(p) => world[p] * locals[i],
            None => locals[i],
        };
        world.push(m);
    }
    world
}

impl PoseEvaluator for ClipEvaluator {
    fn set_current_frame(&mut self, frame: i32) {
        if frame != self.frame {
            self.frame = frame;
            self.cache.clear();
        }
    }

    fn current_frame(&self) -> i32 {
        self.frame
    }

    fn world_pose(&mut self, bone: &str) -> Option<DMat4> {
        let idx = self.skel.index(bone)?;
        Some(self.compute_world(idx))
    }

    fn rest_local(&self, bone: &str) -> Option<DMat4> {
        self.skel.index(bone).map(|i| self.rest_world[i])
    }

    fn bind_local(&self, bone: &str) -> Option<DMat4> {
        self.skel.index(bone).map(|i| self.bind_world[i])
    }

    fn force_rest_pose(&mut self, on: bool) -> bool {
        let previous = self.rest_forced;
        if previous != on {
            self.rest_forced = on;
            self.cache.clear();
        }
        previous
    }

    fn set_constraints_enabled(&mut self, on: bool) -> bool {
        std::mem::replace(&mut self.constraints_enabled, on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{Action, Key};
    use glam::DVec3;
    use motion_common::skeleton::Bone;

    fn two_bone_eval(action: Action) -> ClipEvaluator {
        let mut skel = Skeleton::new();
        skel.add_bone(Bone::new("root", None, DVec3::new(0.0, 0.0, 1.0), DVec3::new(0.0, 0.0, 1.2)))
            .unwrap();
        skel.add_bone(Bone::new(
            "child",
            Some(0),
            DVec3::new(0.0, 0.0, 0.2),
            DVec3::new(0.0, 0.0, 0.4),
        ))
        .unwrap();
        ClipEvaluator::new(skel, ClipSource::from_action(action))
    }

    #[test]
    fn test_unkeyed_pose_matches_rest() {
        let mut eval = two_bone_eval(Action::new("empty"));
        let world = eval.world_pose("child").unwrap();
        let rest = eval.rest_local("child").unwrap();
        assert!((world.w_axis - rest.w_axis).length() < 1e-12);
    }

    #[test]
    fn test_location_curve_replaces_rest_translation() {
        let mut action = Action::new("lift");
        action.push_location(
            "root",
            vec![Key { frame: 0.0, value: DVec3::new(0.0, 0.0, 2.0) }],
        );
        let mut eval = two_bone_eval(action);
        let world = eval.world_pose("child").unwrap();
        // root lifted to z=2, child rest offset 0.2 on top
        assert!((world.w_axis.z - 2.2).abs() < 1e-12);
    }

    #[test]
    fn test_frame_guard_restores_cursor() {
        let mut eval = two_bone_eval(Action::new("empty"));
        eval.set_current_frame(5);
        {
            let mut guard = FrameGuard::new(&mut eval);
            guard.set_current_frame(17);
            assert_eq!(guard.current_frame(), 17);
        }
        assert_eq!(eval.current_frame(), 5);
    }

    #[test]
    fn test_rest_pose_guard_forces_and_restores() {
        let mut action = Action::new("lift");
        action.push_location(
            "root",
            vec![Key { frame: 0.0, value: DVec3::new(0.0, 0.0, 2.0) }],
        );
        let mut eval = two_bone_eval(action);
        assert!((eval.world_pose("root").unwrap().w_axis.z - 2.0).abs() < 1e-12);
        {
            let mut guard = RestPoseGuard::new(&mut eval, true);
            assert!((guard.world_pose("root").unwrap().w_axis.z - 1.0).abs() < 1e-12);
        }
        assert!((eval.world_pose("root").unwrap().w_axis.z - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_constraint_guard_suspends_and_restores() {
        let mut eval = two_bone_eval(Action::new("empty"));
        assert!(eval.set_constraints_enabled(true));
        {
            let _guard = ConstraintGuard::suspend(&mut eval);
        }
        assert!(eval.set_constraints_enabled(true), "restored to enabled");
    }
}
