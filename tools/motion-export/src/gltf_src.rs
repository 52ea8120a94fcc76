//! glTF clip source
//!
//! Loads a skeleton (skin joints, parent links, rest transforms, inverse
//! bind matrices) and keyed actions from a glTF/GLB file. This is the
//! concrete scene source the CLI feeds into the pipeline; the rest of
//! the exporter only ever sees `Skeleton` + `Action`.

use anyhow::{bail, Context, Result};
use glam::{DMat4, DQuat, DVec3};
use hashbrown::HashMap;
use std::path::Path;

use motion_common::skeleton::{Bone, Skeleton};

use crate::clip::{Action, Key};

/// A skeleton with its parent-relative rest/bind matrices and the
/// actions found alongside it.
pub struct LoadedScene {
    pub skeleton: Skeleton,
    /// Parent-relative rest matrices, by bone index
    pub local_rest: Vec<DMat4>,
    /// Parent-relative bind matrices, by bone index
    pub local_bind: Vec<DMat4>,
    pub actions: Vec<Action>,
}

/// Load the skin and animations of a glTF file.
///
/// `fps` converts animation timestamps (seconds) into frame numbers.
pub fn load_scene(input: &Path, skin_index: Option<usize>, fps: f64) -> Result<LoadedScene> {
    let (document, buffers, _images) =
        gltf::import(input).with_context(|| format!("Failed to load glTF: {:?}", input))?;

    let skin = if let Some(idx) = skin_index {
        document
            .skins()
            .nth(idx)
            .with_context(|| format!("Skin index {} not found in glTF", idx))?
    } else {
        document
            .skins()
            .next()
            .context("No skins found in glTF file")?
    };

    let joints: Vec<gltf::Node> = skin.joints().collect();
    if joints.is_empty() {
        bail!("Skin has no joints");
    }

    // node index -> joint slot
    let joint_map: HashMap<usize, usize> = joints
        .iter()
        .enumerate()
        .map(|(i, j)| (j.index(), i))
        .collect();

    // node index -> parent node index, for the whole document
    let mut node_parent: HashMap<usize, usize> = HashMap::new();
    for node in document.nodes() {
        for child in node.children() {
            node_parent.insert(child.index(), node.index());
        }
    }

    // rest transforms straight off the nodes
    let rest: Vec<(DVec3, DQuat, DVec3)> = joints
        .iter()
        .map(|j| {
            let (t, r, s) = j.transform().decomposed();
            (
                DVec3::new(t[0].into(), t[1].into(), t[2].into()),
                DQuat::from_xyzw(r[0].into(), r[1].into(), r[2].into(), r[3].into()).normalize(),
                DVec3::new(s[0].into(), s[1].into(), s[2].into()),
            )
        })
        .collect();

    // parent joint slot per joint, where the parent is itself a joint
    let parent_slot: Vec<Option<usize>> = joints
        .iter()
        .map(|j| {
            let mut node = j.index();
            while let Some(&p) = node_parent.get(&node) {
                if let Some(&slot) = joint_map.get(&p) {
                    return Some(slot);
                }
                node = p;
            }
            None
        })
        .collect();

    let bind_world = bind_world_matrices(&skin, &buffers, &rest, &parent_slot)?;

    // skins may list joints in any order; emit parents before children
    let order = topological_order(&parent_slot);

    let mut skeleton = Skeleton::new();
    let mut local_rest = Vec::with_capacity(joints.len());
    let mut local_bind = Vec::with_capacity(joints.len());
    let mut slot_to_bone: HashMap<usize, usize> = HashMap::new();

    for &slot in &order {
        let node = &joints[slot];
        let name = node
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("joint{slot}"));
        let (t, r, _s) = rest[slot];

        let parent_bone = parent_slot[slot].map(|p| slot_to_bone[&p]);
        let rest_local = DMat4::from_rotation_translation(r, t);
        let bind_local = match parent_slot[slot] {
            Some(p) => bind_world[p].inverse() * bind_world[slot],
            None => bind_world[slot],
        };

        let children_mean = mean_child_offset(node, &joint_map, &rest);
        let tail_dir = r * children_mean;

        let mut bone = Bone::new(name, parent_bone, t, t + tail_dir);
        bone.bind_head = bind_local.w_axis.truncate();
        bone.bind_tail = bone.bind_head + tail_dir;
        bone.use_deform = motion_common::rig::is_deform(&bone.name);

        let bone_idx = skeleton
            .add_bone(bone)
            .context("glTF joint hierarchy is inconsistent")?;
        slot_to_bone.insert(slot, bone_idx);
        local_rest.push(rest_local);
        local_bind.push(bind_local);
    }

    let joint_names: Vec<String> = skeleton.bones().iter().map(|b| b.name.clone()).collect();
    let slot_names: HashMap<usize, &str> = slot_to_bone
        .iter()
        .map(|(&slot, &bone)| (joints[slot].index(), joint_names[bone].as_str()))
        .collect();

    let mut actions = Vec::new();
    for animation in document.animations() {
        actions.push(load_action(&animation, &buffers, &slot_names, fps)?);
    }

    Ok(LoadedScene {
        skeleton,
        local_rest,
        local_bind,
        actions,
    })
}

/// Armature-space bind matrices: inverted inverse-bind accessors, falling
/// back to the accumulated rest pose when the skin carries none.
fn bind_world_matrices(
    skin: &gltf::Skin,
    buffers: &[gltf::buffer::Data],
    rest: &[(DVec3, DQuat, DVec3)],
    parent_slot: &[Option<usize>],
) -> Result<Vec<DMat4>> {
    if let Some(accessor) = skin.inverse_bind_matrices() {
        let mats = read_mat4(&accessor, buffers)?;
        if mats.len() != rest.len() {
            bail!(
                "Inverse bind matrix count {} does not match joint count {}",
                mats.len(),
                rest.len()
            );
        }
        return Ok(mats.iter().map(|m| m.inverse()).collect());
    }
    // accumulate rest locals; parents always occupy earlier slots or get
    // resolved lazily through recursion-free passes
    let mut world = vec![None; rest.len()];
    fn resolve(
        slot: usize,
        rest: &[(DVec3, DQuat, DVec3)],
        parent_slot: &[Option<usize>],
        world: &mut Vec<Option<DMat4>>,
    ) -> DMat4 {
        if let Some(m) = world[slot] {
            return m;
        }
        let (t, r, _) = rest[slot];
        let local = DMat4::from_rotation_translation(r, t);
        let m = match parent_slot[slot] {
            Some(p) => resolve(p, rest, parent_slot, world) * local,
            None => local,
        };
        world[slot] = Some(m);
        m
    }
    Ok((0..rest.len())
        .map(|slot| resolve(slot, rest, parent_slot, &mut world))
        .collect())
}

/// Joint slots ordered parents-first.
fn topological_order(parent_slot: &[Option<usize>]) -> Vec<usize> {
    let mut order = Vec::with_capacity(parent_slot.len());
    let mut placed = vec![false; parent_slot.len()];
    while order.len() < parent_slot.len() {
        let before = order.len();
        for slot in 0..parent_slot.len() {
            if placed[slot] {
                continue;
            }
            let ready = match parent_slot[slot] {
                Some(p) => placed[p],
                None => true,
            };
            if ready {
                placed[slot] = true;
                order.push(slot);
            }
        }
        if order.len() == before {
            // parent cycle; emit the rest as roots rather than spin
            for slot in 0..parent_slot.len() {
                if !placed[slot] {
                    placed[slot] = true;
                    order.push(slot);
                }
            }
        }
    }
    order
}

/// Average local offset of a joint's joint-children, for tail placement.
fn mean_child_offset(
    node: &gltf::Node,
    joint_map: &HashMap<usize, usize>,
    rest: &[(DVec3, DQuat, DVec3)],
) -> DVec3 {
    let mut sum = DVec3::ZERO;
    let mut count = 0;
    for child in node.children() {
        if let Some(&slot) = joint_map.get(&child.index()) {
            sum += rest[slot].0;
            count += 1;
        }
    }
    if count > 0 {
        sum / f64::from(count)
    } else {
        DVec3::new(0.0, 0.05, 0.0)
    }
}

/// Convert one glTF animation into an action keyed in frames.
fn load_action(
    animation: &gltf::Animation,
    buffers: &[gltf::buffer::Data],
    node_names: &HashMap<usize, &str>,
    fps: f64,
) -> Result<Action> {
    let mut action = Action::new(animation.name().unwrap_or("unnamed"));
    for channel in animation.channels() {
        let node_index = channel.target().node().index();
        let Some(bone) = node_names.get(&node_index) else {
            continue; // not one of our joints
        };
        let sampler = channel.sampler();
        let times = read_scalars(&sampler.input(), buffers)?;

        match channel.target().property() {
            gltf::animation::Property::Rotation => {
                let values = read_quats(&sampler.output(), buffers)?;
                let keys = times
                    .iter()
                    .zip(values)
                    .map(|(&t, q)| Key { frame: t * fps, value: q })
                    .collect();
                action.push_rotation(bone, keys);
            }
            gltf::animation::Property::Translation => {
                let values = read_vec3s(&sampler.output(), buffers)?;
                let keys = times
                    .iter()
                    .zip(values)
                    .map(|(&t, v)| Key { frame: t * fps, value: v })
                    .collect();
                action.push_location(bone, keys);
            }
            _ => {} // scale and morph weights are never exported
        }
    }
    Ok(action)
}

// ============================================================================
// glTF accessor readers
// ============================================================================

fn accessor_bytes<'a>(
    accessor: &gltf::Accessor,
    buffers: &'a [gltf::buffer::Data],
) -> Result<(&'a [u8], usize, usize)> {
    let view = accessor.view().context("Accessor has no buffer view")?;
    let buffer: &[u8] = &buffers[view.buffer().index()];
    let offset = view.offset() + accessor.offset();
    let stride = view.stride().unwrap_or(accessor.size());
    Ok((buffer, offset, stride))
}

fn read_f32_at(bytes: &[u8], offset: usize) -> f64 {
    f64::from(f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ]))
}

fn read_scalars(accessor: &gltf::Accessor, buffers: &[gltf::buffer::Data]) -> Result<Vec<f64>> {
    let (bytes, offset, stride) = accessor_bytes(accessor, buffers)?;
    Ok((0..accessor.count())
        .map(|i| read_f32_at(bytes, offset + i * stride))
        .collect())
}

fn read_vec3s(accessor: &gltf::Accessor, buffers: &[gltf::buffer::Data]) -> Result<Vec<DVec3>> {
    let (bytes, offset, stride) = accessor_bytes(accessor, buffers)?;
    Ok((0..accessor.count())
        .map(|i| {
            let base = offset + i * stride;
            DVec3::new(
                read_f32_at(bytes, base),
                read_f32_at(bytes, base + 4),
                read_f32_at(bytes, base + 8),
            )
        })
        .collect())
}

fn read_quats(accessor: &gltf::Accessor, buffers: &[gltf::buffer::Data]) -> Result<Vec<DQuat>> {
    let (bytes, offset, stride) = accessor_bytes(accessor, buffers)?;
    Ok((0..accessor.count())
        .map(|i| {
            let base = offset + i * stride;
            DQuat::from_xyzw(
                read_f32_at(bytes, base),
                read_f32_at(bytes, base + 4),
                read_f32_at(bytes, base + 8),
                read_f32_at(bytes, base + 12),
            )
            .normalize()
        })
        .collect())
}

fn read_mat4(accessor: &gltf::Accessor, buffers: &[gltf::buffer::Data]) -> Result<Vec<DMat4>> {
    let (bytes, offset, stride) = accessor_bytes(accessor, buffers)?;
    Ok((0..accessor.count())
        .map(|i| {
            let base = offset + i * stride;
            let mut cols = [0.0f64; 16];
            for (j, v) in cols.iter_mut().enumerate() {
                *v = read_f32_at(bytes, base + j * 4);
            }
            DMat4::from_cols_array(&cols)
        })
        .collect())
}

/// List the animations of a glTF file (name, channel count, duration).
pub fn list_animations(input: &Path) -> Result<()> {
    let (document, buffers, _images) =
        gltf::import(input).with_context(|| format!("Failed to load glTF: {:?}", input))?;

    let animations: Vec<_> = document.animations().collect();
    if animations.is_empty() {
        tracing::info!("No animations found in {:?}", input);
        return Ok(());
    }

    tracing::info!("Animations in {:?}:", input);
    for (i, anim) in animations.iter().enumerate() {
        let mut max_time: f64 = 0.0;
        for channel in anim.channels() {
            if let Ok(times) = read_scalars(&channel.sampler().input(), &buffers) {
                if let Some(&t) = times.last() {
                    max_time = max_time.max(t);
                }
            }
        }
        tracing::info!(
            "  [{}] '{}': {} channels, {:.2}s",
            i,
            anim.name().unwrap_or("unnamed"),
            anim.channels().count(),
            max_time
        );
    }
    Ok(())
}
