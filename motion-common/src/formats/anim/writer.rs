//! Binary clip writer

use std::io::{self, Write};

use super::header::Reader;
use super::quant::encode_u16;
use super::types::{ExportJoint, ExportRecord};

/// Hard limit on exported joints; the consumer rejects anything larger.
pub const MAX_EXPORT_JOINTS: usize = 32;

/// Maximum root offset in meters; locations quantize over `[-1, 1]` after
/// dividing by this.
pub const MAX_PELVIS_OFFSET: f64 = 5.0;

#[derive(Debug, thiserror::Error)]
pub enum AnimError {
    /// More distinct joints than the consumer accepts
    #[error("{count} exported joints exceed the limit of {MAX_EXPORT_JOINTS}")]
    TooManyJoints { count: usize },

    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Recoverable conditions noticed while writing, reported to the caller
/// instead of failing the export.
#[derive(Debug, Clone, Default)]
pub struct AnimWriteSummary {
    /// Joints skipped because an earlier joint resolved to the same name
    pub duplicates: Vec<String>,
    /// Joints announced with zero keys on both channels
    pub silent: Vec<String>,
}

fn write_cstr<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_all(&[0])
}

fn write_rot_keys<W: Write>(w: &mut W, joint: &ExportJoint, duration: f64) -> io::Result<()> {
    w.write_all(&(joint.rot_keys.len() as i32).to_le_bytes())?;
    for key in &joint.rot_keys {
        let mut q = key.rot.normalize();
        // w is implied; keep it non-negative so the consumer reconstructs
        // the short way around
        if q.w < 0.0 {
            q = -q;
        }
        w.write_all(&encode_u16(key.time, 0.0, duration).to_le_bytes())?;
        w.write_all(&encode_u16(q.x, -1.0, 1.0).to_le_bytes())?;
        w.write_all(&encode_u16(q.y, -1.0, 1.0).to_le_bytes())?;
        w.write_all(&encode_u16(q.z, -1.0, 1.0).to_le_bytes())?;
    }
    Ok(())
}

fn write_loc_keys<W: Write>(w: &mut W, joint: &ExportJoint, duration: f64) -> io::Result<()> {
    w.write_all(&(joint.loc_keys.len() as i32).to_le_bytes())?;
    for key in &joint.loc_keys {
        let v = key.loc * joint.pscale / MAX_PELVIS_OFFSET;
        w.write_all(&encode_u16(key.time, 0.0, duration).to_le_bytes())?;
        w.write_all(&encode_u16(v.x, -1.0, 1.0).to_le_bytes())?;
        w.write_all(&encode_u16(v.y, -1.0, 1.0).to_le_bytes())?;
        w.write_all(&encode_u16(v.z, -1.0, 1.0).to_le_bytes())?;
    }
    Ok(())
}

/// Write a complete binary clip.
///
/// Joints are emitted in record order, deduplicated by resolved export
/// name (the first occurrence wins). Joints without any key data are
/// still announced with two zero counts; both conditions land in the
/// returned summary rather than failing the write.
pub fn write_anim<W: Write>(w: &mut W, record: &ExportRecord) -> Result<AnimWriteSummary, AnimError> {
    let mut summary = AnimWriteSummary::default();
    let mut joints: Vec<&ExportJoint> = Vec::with_capacity(record.joints.len());
    for joint in &record.joints {
        if joints.iter().any(|j| j.name == joint.name) {
            summary.duplicates.push(joint.name.clone());
        } else {
            joints.push(joint);
        }
    }

    if joints.len() > MAX_EXPORT_JOINTS {
        return Err(AnimError::TooManyJoints { count: joints.len() });
    }

    record.header(joints.len() as i32).write_to(w)?;

    for joint in joints {
        write_cstr(w, &joint.name)?;
        w.write_all(&joint.priority.to_le_bytes())?;
        write_rot_keys(w, joint, record.duration)?;
        write_loc_keys(w, joint, record.duration)?;
        if joint.is_silent() {
            summary.silent.push(joint.name.clone());
        }
    }

    // end-of-stream sentinel; redundant with the declared joint count but
    // legacy consumers may depend on it
    w.write_all(&0_i32.to_le_bytes())?;

    Ok(summary)
}

/// Read back the joint names of a written clip, in stream order.
///
/// Tolerates but does not require the trailing sentinel. Intended for
/// tests and tooling, not playback.
pub fn read_joint_names(bytes: &[u8]) -> Option<Vec<String>> {
    let (header, consumed) = super::header::AnimHeader::from_bytes(bytes)?;
    let mut r = Reader { bytes, pos: consumed };
    let mut names = Vec::new();
    for _ in 0..header.joint_count {
        names.push(r.cstr()?);
        r.skip(4)?; // priority
        for _ in 0..2 {
            let count = r.i32()?;
            r.skip(count as usize * 8)?;
        }
    }
    Some(names)
}
