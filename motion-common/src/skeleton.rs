//! Skeleton data model
//!
//! An ordered forest of bones with parent links. Bones are stored in
//! topological order (parents before children), which rules out cycles by
//! construction and lets hierarchy walks run as simple index scans.
//!
//! Head/tail positions are parent-relative and kept twice: the rest pose
//! (the authoring-time default) and the bind pose (the pose motion was
//! originally authored against). The two may differ in proportions between
//! a retarget source and target.

use glam::{DMat4, DQuat, DVec3};
use hashbrown::HashMap;

/// One bone in a skeleton.
#[derive(Debug, Clone)]
pub struct Bone {
    /// Unique name within the skeleton
    pub name: String,
    /// Index of the parent bone; `None` for roots
    pub parent: Option<usize>,
    /// Rest-pose head position, parent-relative
    pub rest_head: DVec3,
    /// Rest-pose tail position, parent-relative
    pub rest_tail: DVec3,
    /// Bind-pose head position, parent-relative
    pub bind_head: DVec3,
    /// Bind-pose tail position, parent-relative
    pub bind_tail: DVec3,
    /// Whether the bone's head is welded to its parent's tail
    pub connected: bool,
    /// Declared export priority; `None` falls back to the clip priority
    pub priority: Option<i32>,
    /// Same-armature constraint targets (feeds the driver/driven graph)
    pub constraint_targets: Vec<String>,
    /// Whether the bone deforms geometry (deform bones carry the export data)
    pub use_deform: bool,
}

impl Bone {
    /// A bone with default metadata at the given parent-relative head.
    pub fn new(name: impl Into<String>, parent: Option<usize>, head: DVec3, tail: DVec3) -> Self {
        Self {
            name: name.into(),
            parent,
            rest_head: head,
            rest_tail: tail,
            bind_head: head,
            bind_tail: tail,
            connected: false,
            priority: None,
            constraint_targets: Vec::new(),
            use_deform: true,
        }
    }
}

/// Per-bone rest metadata cached during channel collection.
///
/// Populated once from the rig's bind or rest matrices and read-only
/// afterwards; later phases never re-derive it.
#[derive(Debug, Clone, Copy)]
pub struct BoneRestInfo {
    /// Reference orientation of the bone relative to its parent
    pub rot0: DQuat,
    /// Parent scale at bind time (location compensation at export)
    pub pscale0: DVec3,
    /// Head offset from the parent, in the parent's frame
    pub offset0: DVec3,
}

impl Default for BoneRestInfo {
    fn default() -> Self {
        Self {
            rot0: DQuat::IDENTITY,
            pscale0: DVec3::ONE,
            offset0: DVec3::ZERO,
        }
    }
}

/// Errors raised while assembling a skeleton.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SkeletonError {
    #[error("duplicate bone name '{0}'")]
    DuplicateBone(String),

    #[error("bone '{bone}' references unknown parent index {parent}")]
    MissingParent { bone: String, parent: usize },
}

/// An ordered forest of bones.
#[derive(Debug, Clone)]
pub struct Skeleton {
    bones: Vec<Bone>,
    by_name: HashMap<String, usize>,
    /// Object-level placement of the armature in the scene
    pub world: DMat4,
    /// Uniform armature object scale
    pub scale: f64,
}

impl Skeleton {
    pub fn new() -> Self {
        Self {
            bones: Vec::new(),
            by_name: HashMap::new(),
            world: DMat4::IDENTITY,
            scale: 1.0,
        }
    }

    /// Append a bone. The parent, if any, must already be present, so the
    /// bone list is topologically ordered and cycle-free by construction.
    pub fn add_bone(&mut self, bone: Bone) -> Result<usize, SkeletonError> {
        if self.by_name.contains_key(&bone.name) {
            return Err(SkeletonError::DuplicateBone(bone.name));
        }
        if let Some(p) = bone.parent {
            if p >= self.bones.len() {
                return Err(SkeletonError::MissingParent {
                    bone: bone.name,
                    parent: p,
                });
            }
        }
        let index = self.bones.len();
        self.by_name.insert(bone.name.clone(), index);
        self.bones.push(bone);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn bone(&self, name: &str) -> Option<&Bone> {
        self.index(name).map(|i| &self.bones[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Parent bone of a named bone, if both exist.
    pub fn parent_of(&self, name: &str) -> Option<&Bone> {
        self.bone(name)
            .and_then(|b| b.parent)
            .map(|p| &self.bones[p])
    }

    /// Direct children of a bone, in bone order.
    pub fn children_of(&self, name: &str) -> Vec<&Bone> {
        match self.index(name) {
            Some(i) => self
                .bones
                .iter()
                .filter(|b| b.parent == Some(i))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All transitive descendants of a bone, in bone order.
    pub fn descendants_of(&self, name: &str) -> Vec<&Bone> {
        let Some(root) = self.index(name) else {
            return Vec::new();
        };
        let mut in_subtree = vec![false; self.bones.len()];
        in_subtree[root] = true;
        let mut out = Vec::new();
        for (i, bone) in self.bones.iter().enumerate() {
            if let Some(p) = bone.parent {
                if in_subtree[p] {
                    in_subtree[i] = true;
                    out.push(bone);
                }
            }
        }
        out
    }

    /// Whether `ancestor` lies on the parent chain of `name` (or is `name`).
    pub fn is_ancestor_or_self(&self, ancestor: &str, name: &str) -> bool {
        let Some(anc) = self.index(ancestor) else {
            return false;
        };
        let mut cur = self.index(name);
        while let Some(i) = cur {
            if i == anc {
                return true;
            }
            cur = self.bones[i].parent;
        }
        false
    }

    /// Armature-space rest head position, accumulated over the parent chain.
    pub fn rest_head_world(&self, name: &str) -> Option<DVec3> {
        let mut i = self.index(name)?;
        let mut pos = self.bones[i].rest_head;
        while let Some(p) = self.bones[i].parent {
            pos += self.bones[p].rest_head;
            i = p;
        }
        Some(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bone() -> Skeleton {
        let mut s = Skeleton::new();
        s.add_bone(Bone::new("root", None, DVec3::ZERO, DVec3::Z)).unwrap();
        s.add_bone(Bone::new("child", Some(0), DVec3::Z, DVec3::Z * 2.0))
            .unwrap();
        s
    }

    #[test]
    fn test_lookup_and_parent() {
        let s = two_bone();
        assert_eq!(s.index("root"), Some(0));
        assert_eq!(s.parent_of("child").unwrap().name, "root");
        assert!(s.parent_of("root").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut s = two_bone();
        let err = s
            .add_bone(Bone::new("child", Some(0), DVec3::ZERO, DVec3::Z))
            .unwrap_err();
        assert!(matches!(err, SkeletonError::DuplicateBone(_)));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut s = Skeleton::new();
        let err = s
            .add_bone(Bone::new("orphan", Some(7), DVec3::ZERO, DVec3::Z))
            .unwrap_err();
        assert!(matches!(err, SkeletonError::MissingParent { parent: 7, .. }));
    }

    #[test]
    fn test_descendants_and_ancestry() {
        let mut s = two_bone();
        s.add_bone(Bone::new("tip", Some(1), DVec3::Z, DVec3::Z * 3.0))
            .unwrap();
        let names: Vec<_> = s.descendants_of("root").iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["child", "tip"]);
        assert!(s.is_ancestor_or_self("root", "tip"));
        assert!(s.is_ancestor_or_self("tip", "tip"));
        assert!(!s.is_ancestor_or_self("tip", "root"));
    }

    #[test]
    fn test_rest_head_world_accumulates() {
        let s = two_bone();
        assert_eq!(s.rest_head_world("child"), Some(DVec3::Z));
    }
}
