//! Keyed animation clips
//!
//! An `Action` is a named set of per-bone curves; a `ClipSource` stacks a
//! base action with layered actions that can be disabled or muted, the
//! way the host's non-linear editor layers clips. Curve values are the
//! bone's parent-relative local pose (they replace the rest transform,
//! matching the scene format the loader reads).

use glam::{DQuat, DVec3};

/// One key on a curve.
#[derive(Debug, Clone, Copy)]
pub struct Key<T> {
    pub frame: f64,
    pub value: T,
}

/// Transform kind a curve animates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveKind {
    Rotation,
    Location,
    Scale,
    /// Anything else keyed on a bone (constraint influence etc.); routed
    /// through the driver graph at collection time
    Influence,
}

/// Keyed data of one curve.
#[derive(Debug, Clone)]
pub enum CurveData {
    Rotation(Vec<Key<DQuat>>),
    Location(Vec<Key<DVec3>>),
    Scale(Vec<Key<DVec3>>),
    Influence(Vec<Key<f64>>),
}

/// One keyed curve targeting a bone.
#[derive(Debug, Clone)]
pub struct FCurve {
    pub bone: String,
    pub data: CurveData,
}

impl FCurve {
    pub fn kind(&self) -> CurveKind {
        match self.data {
            CurveData::Rotation(_) => CurveKind::Rotation,
            CurveData::Location(_) => CurveKind::Location,
            CurveData::Scale(_) => CurveKind::Scale,
            CurveData::Influence(_) => CurveKind::Influence,
        }
    }
}

/// Linear interpolation over a key list; clamps outside the keyed range.
fn sample_keys<T, F>(keys: &[Key<T>], frame: f64, lerp: F) -> Option<T>
where
    T: Copy,
    F: Fn(T, T, f64) -> T,
{
    let first = keys.first()?;
    if frame <= first.frame {
        return Some(first.value);
    }
    let last = keys.last()?;
    if frame >= last.frame {
        return Some(last.value);
    }
    let mut i = 0;
    while i < keys.len() - 1 && keys[i + 1].frame < frame {
        i += 1;
    }
    let (a, b) = (&keys[i], &keys[i + 1]);
    let span = b.frame - a.frame;
    let t = if span > 0.0 { (frame - a.frame) / span } else { 0.0 };
    Some(lerp(a.value, b.value, t.clamp(0.0, 1.0)))
}

/// A named set of keyed curves.
#[derive(Debug, Clone, Default)]
pub struct Action {
    pub name: String,
    pub curves: Vec<FCurve>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            curves: Vec::new(),
        }
    }

    fn rotation_curve(&self, bone: &str) -> Option<&[Key<DQuat>]> {
        self.curves.iter().find_map(|c| match &c.data {
            CurveData::Rotation(keys) if c.bone == bone => Some(keys.as_slice()),
            _ => None,
        })
    }

    fn location_curve(&self, bone: &str) -> Option<&[Key<DVec3>]> {
        self.curves.iter().find_map(|c| match &c.data {
            CurveData::Location(keys) if c.bone == bone => Some(keys.as_slice()),
            _ => None,
        })
    }

    /// Local rotation at a frame; `None` when the bone has no rotation
    /// curve.
    pub fn sample_rotation(&self, bone: &str, frame: f64) -> Option<DQuat> {
        let keys = self.rotation_curve(bone)?;
        sample_keys(keys, frame, |a, b, t| a.slerp(b, t).normalize())
    }

    /// Local location at a frame; `None` when the bone has no location
    /// curve.
    pub fn sample_location(&self, bone: &str, frame: f64) -> Option<DVec3> {
        let keys = self.location_curve(bone)?;
        sample_keys(keys, frame, DVec3::lerp)
    }

    /// Inclusive keyed frame range across all curves.
    pub fn frame_range(&self) -> Option<(i32, i32)> {
        let mut range: Option<(f64, f64)> = None;
        for curve in &self.curves {
            let frames: Box<dyn Iterator<Item = f64> + '_> = match &curve.data {
                CurveData::Rotation(k) => Box::new(k.iter().map(|k| k.frame)),
                CurveData::Location(k) | CurveData::Scale(k) => {
                    Box::new(k.iter().map(|k| k.frame))
                }
                CurveData::Influence(k) => Box::new(k.iter().map(|k| k.frame)),
            };
            for f in frames {
                range = Some(match range {
                    None => (f, f),
                    Some((lo, hi)) => (lo.min(f), hi.max(f)),
                });
            }
        }
        range.map(|(lo, hi)| (lo.floor() as i32, hi.ceil() as i32))
    }

    /// Append a rotation curve for a bone.
    pub fn push_rotation(&mut self, bone: &str, keys: Vec<Key<DQuat>>) {
        self.curves.push(FCurve {
            bone: bone.to_string(),
            data: CurveData::Rotation(keys),
        });
    }

    /// Append a location curve for a bone.
    pub fn push_location(&mut self, bone: &str, keys: Vec<Key<DVec3>>) {
        self.curves.push(FCurve {
            bone: bone.to_string(),
            data: CurveData::Location(keys),
        });
    }
}

/// One layered action with its editor flags.
#[derive(Debug, Clone)]
pub struct ClipLayer {
    pub action: Action,
    pub enabled: bool,
    pub muted: bool,
}

/// A base action plus layered actions. Only enabled, unmuted layers
/// contribute; for sampling, the last contributing layer wins.
#[derive(Debug, Clone)]
pub struct ClipSource {
    pub base: Action,
    pub layers: Vec<ClipLayer>,
}

impl ClipSource {
    pub fn from_action(base: Action) -> Self {
        Self {
            base,
            layers: Vec::new(),
        }
    }

    fn active_layers(&self) -> impl DoubleEndedIterator<Item = &Action> {
        self.layers
            .iter()
            .filter(|l| l.enabled && !l.muted)
            .map(|l| &l.action)
    }

    /// All contributing curves, base first then active layers.
    pub fn curves(&self) -> impl Iterator<Item = &FCurve> {
        self.base
            .curves
            .iter()
            .chain(self.active_layers().flat_map(|a| a.curves.iter()))
    }

    pub fn sample_rotation(&self, bone: &str, frame: f64) -> Option<DQuat> {
        self.active_layers()
            .rev()
            .find_map(|a| a.sample_rotation(bone, frame))
            .or_else(|| self.base.sample_rotation(bone, frame))
    }

    pub fn sample_location(&self, bone: &str, frame: f64) -> Option<DVec3> {
        self.active_layers()
            .rev()
            .find_map(|a| a.sample_location(bone, frame))
            .or_else(|| self.base.sample_location(bone, frame))
    }

    /// Keyed frame range over base and active layers.
    pub fn frame_range(&self) -> Option<(i32, i32)> {
        let mut range: Option<(i32, i32)> = self.base.frame_range();
        for action in self.active_layers() {
            if let Some((lo, hi)) = action.frame_range() {
                range = Some(match range {
                    None => (lo, hi),
                    Some((a, b)) => (a.min(lo), b.max(hi)),
                });
            }
        }
        range
    }
}
