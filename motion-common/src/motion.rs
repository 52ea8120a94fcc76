//! Channel sets and sampled motion
//!
//! `ChannelSet` names which bones need rotation and/or translation keys
//! and remembers the order bones were first touched in - the binary
//! serializer emits joints in exactly that order. `SampledMotion` holds
//! the per-frame pose samples the sampler produced; once built it is only
//! ever read.

use glam::DMat4;
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;

use crate::skeleton::BoneRestInfo;

/// Which bones carry rotation and/or translation channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelSet {
    order: Vec<String>,
    rots: HashSet<String>,
    locs: HashSet<String>,
    rest_info: HashMap<String, BoneRestInfo>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, name: &str) {
        if !self.rots.contains(name) && !self.locs.contains(name) {
            self.order.push(name.to_string());
        }
    }

    /// Add a rotation channel. Returns false if it was already present.
    pub fn add_rot(&mut self, name: &str) -> bool {
        self.touch(name);
        self.rots.insert(name.to_string())
    }

    /// Add a translation channel. Returns false if it was already present.
    pub fn add_loc(&mut self, name: &str) -> bool {
        self.touch(name);
        self.locs.insert(name.to_string())
    }

    pub fn has_rot(&self, name: &str) -> bool {
        self.rots.contains(name)
    }

    pub fn has_loc(&self, name: &str) -> bool {
        self.locs.contains(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.has_rot(name) || self.has_loc(name)
    }

    /// Bone names in first-touch order (the serializer's joint order).
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Number of distinct bones carrying any channel.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Cache rest metadata for a bone. The first value wins; collection
    /// populates each record exactly once.
    pub fn put_rest_info(&mut self, name: &str, info: BoneRestInfo) {
        self.rest_info.entry(name.to_string()).or_insert(info);
    }

    pub fn rest_info(&self, name: &str) -> Option<&BoneRestInfo> {
        self.rest_info.get(name)
    }

    pub fn has_rest_info(&self, name: &str) -> bool {
        self.rest_info.contains_key(name)
    }
}

/// One bone's pose data for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameSample {
    /// The animator's delta over rest, constraint effects baked in,
    /// expressed in the bone's rest-orientation basis
    pub visual: DMat4,
    /// Parent's evaluated pose matrix, armature space
    pub parent_pose: DMat4,
    /// The bone's own evaluated pose matrix, armature space
    pub pose: DMat4,
}

/// All samples for all requested frames and bones, keyed frame -> bone.
#[derive(Debug, Clone, Default)]
pub struct SampledMotion {
    frames: BTreeMap<i32, HashMap<String, FrameSample>>,
}

impl SampledMotion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame: i32, bone: &str, sample: FrameSample) {
        self.frames
            .entry(frame)
            .or_default()
            .insert(bone.to_string(), sample);
    }

    pub fn get(&self, frame: i32, bone: &str) -> Option<&FrameSample> {
        self.frames.get(&frame).and_then(|m| m.get(bone))
    }

    /// Frames that hold at least one sample, ascending.
    pub fn frames(&self) -> impl Iterator<Item = i32> + '_ {
        self.frames.keys().copied()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_order_is_first_touch() {
        let mut ch = ChannelSet::new();
        ch.add_rot("b");
        ch.add_loc("a");
        ch.add_loc("b");
        ch.add_rot("a");
        assert_eq!(ch.order(), ["b".to_string(), "a".to_string()]);
        assert_eq!(ch.len(), 2);
        assert!(ch.has_rot("a") && ch.has_loc("a"));
    }

    #[test]
    fn test_rest_info_first_value_wins() {
        let mut ch = ChannelSet::new();
        let mut info = BoneRestInfo::default();
        info.offset0.z = 1.0;
        ch.put_rest_info("b", info);
        ch.put_rest_info("b", BoneRestInfo::default());
        assert_eq!(ch.rest_info("b").unwrap().offset0.z, 1.0);
    }
}
